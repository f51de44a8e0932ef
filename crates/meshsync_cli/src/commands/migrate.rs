//! `meshsync migrate`

use std::path::Path;

use meshsync_codec::Value;
use meshsync_engine::EngineResult;

use super::open_engine;

/// Parses a default-value argument: integer, then real, then text.
fn parse_default(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::Integer(n);
    }
    if let Ok(f) = text.parse::<f64>() {
        if f.is_finite() {
            return Value::Real(f);
        }
    }
    Value::text(text)
}

pub fn run(
    db: &Path,
    table: &str,
    column: &str,
    column_type: &str,
    default: Option<&str>,
) -> EngineResult<()> {
    let engine = open_engine(db, None)?;
    let migration = engine.add_column(table, column, column_type, default.map(parse_default))?;
    println!(
        "added {}.{} ({}), schema version {} → {}",
        table, column, migration.column_type, migration.from_version, migration.to_version
    );
    println!("migration will replicate with the next sync");
    engine.close()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parsing_prefers_numbers() {
        assert_eq!(parse_default("42"), Value::Integer(42));
        assert_eq!(parse_default("-1"), Value::Integer(-1));
        assert_eq!(parse_default("2.5"), Value::Real(2.5));
        assert_eq!(parse_default("high"), Value::text("high"));
    }
}
