use anyhow::Context;
use rusqlite::{params, Connection};

pub fn run(conn: &Connection, model: &str, text: &str) -> anyhow::Result<()> {
    let json: String = conn
        .query_row(
            "SELECT lembed_tokenize_json(?, ?)",
            params![model, text],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to tokenize with model '{}'", model))?;
    println!("{}", json);
    Ok(())
}
