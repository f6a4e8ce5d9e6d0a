use anyhow::Context;
use rusqlite::{params, Connection};

pub fn run(conn: &Connection, model: &str, text: &str) -> anyhow::Result<()> {
    let blob: Vec<u8> = conn
        .query_row("SELECT lembed(?, ?)", params![model, text], |row| row.get(0))
        .with_context(|| format!("failed to embed with model '{}'", model))?;

    let embedding = decode_f32(&blob)?;
    println!("{}", serde_json::to_string(&embedding)?);
    Ok(())
}

/// Decode a little-endian float32 vector blob
fn decode_f32(blob: &[u8]) -> anyhow::Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("embedding blob has {} bytes, not a multiple of 4", blob.len());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
