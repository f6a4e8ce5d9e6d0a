use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::fmt::Write;

pub fn run(conn: &Connection, sql: &str) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();

    if column_count == 0 {
        let changed = stmt.execute([])?;
        println!("{} row(s) changed", changed);
        return Ok(());
    }

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut fields = Vec::with_capacity(column_count);
        for i in 0..column_count {
            fields.push(format_value(row.get_ref(i)?));
        }
        println!("{}", fields.join("\t"));
    }

    Ok(())
}

/// Render a value the way the sqlite3 shell would quote it
fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => {
            let mut hex = String::with_capacity(b.len() * 2 + 3);
            hex.push_str("x'");
            for byte in b {
                let _ = write!(hex, "{:02x}", byte);
            }
            hex.push('\'');
            hex
        }
    }
}
