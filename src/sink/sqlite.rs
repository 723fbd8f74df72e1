use std::path::Path;

use chrono::SecondsFormat;
use rusqlite::{params, Connection};

use super::{SinkError, StorageSink};
use crate::reading::Reading;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sensor_data (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        sensor_name TEXT NOT NULL,
        slave_id INTEGER NOT NULL,
        temperature REAL NOT NULL,
        humidity REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_timestamp ON sensor_data(timestamp);
    CREATE INDEX IF NOT EXISTS idx_sensor_name ON sensor_data(sensor_name);
";

const INSERT: &str = "INSERT INTO sensor_data (timestamp, sensor_name, slave_id, temperature, humidity)
                      VALUES (?1, ?2, ?3, ?4, ?5)";

/// Tabla `sensor_data` en un archivo SQLite.
pub struct SqliteSink {
    conn: Option<Connection>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut Connection, SinkError> {
        self.conn.as_mut().ok_or(SinkError::Closed("sqlite"))
    }
}

fn insert(conn: &Connection, reading: &Reading) -> rusqlite::Result<()> {
    conn.prepare_cached(INSERT)?.execute(params![
        reading.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        reading.sensor_name,
        reading.slave_id,
        reading.temperature,
        reading.humidity,
    ])?;
    Ok(())
}

impl StorageSink for SqliteSink {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn save(&mut self, reading: &Reading) -> Result<(), SinkError> {
        insert(self.conn()?, reading)?;
        Ok(())
    }

    fn save_batch(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        let tx = self.conn()?.transaction()?;
        for reading in readings {
            insert(&tx, reading)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }
}
