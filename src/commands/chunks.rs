use anyhow::Context;
use rusqlite::{params, Connection};

pub fn run(
    conn: &Connection,
    model: &str,
    text: &str,
    chunk_size: Option<usize>,
) -> anyhow::Result<()> {
    let chunk_size = chunk_size.map(|size| size as i64);
    let sql = if chunk_size.is_some() {
        "SELECT rowid, token_count, contents FROM lembed_chunks(?1, ?2, ?3)"
    } else {
        "SELECT rowid, token_count, contents FROM lembed_chunks(?1, ?2)"
    };

    let mut stmt = conn.prepare(sql)?;
    let mut rows = match chunk_size {
        Some(size) => stmt.query(params![model, text, size])?,
        None => stmt.query(params![model, text])?,
    };

    while let Some(row) = rows
        .next()
        .with_context(|| format!("failed to chunk with model '{}'", model))?
    {
        let index: i64 = row.get(0)?;
        let token_count: i64 = row.get(1)?;
        let contents: String = row.get(2)?;
        println!(
            "{}\t{}\t{}",
            index,
            token_count,
            serde_json::to_string(&contents)?
        );
    }

    Ok(())
}
