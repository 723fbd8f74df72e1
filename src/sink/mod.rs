//! Destinos finales de las lecturas.
//!
//! El destino se elige una sola vez desde la configuración. La caché es
//! quien lo invoca; un error aquí nunca llega al bucle de lectura.

mod csv_log;
mod influx;
mod sqlite;

use std::io;

use log::info;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::reading::Reading;

pub use csv_log::CsvSink;
pub use influx::{line_protocol, InfluxSink};
pub use sqlite::SqliteSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("error de SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("error de E/S: {0}")]
    Io(#[from] io::Error),

    #[error("error escribiendo CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("el servidor rechazó la escritura ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("el almacenamiento {0} ya está cerrado")]
    Closed(&'static str),
}

pub trait StorageSink: Send {
    /// Nombre corto para los logs.
    fn kind(&self) -> &'static str;

    fn save(&mut self, reading: &Reading) -> Result<(), SinkError>;

    /// Por defecto guarda una a una y se detiene en el primer error.
    fn save_batch(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        for reading in readings {
            self.save(reading)?;
        }
        Ok(())
    }

    /// `true` si `save_batch` es atómico: o se guarda todo o nada.
    fn supports_batch(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Construye el destino configurado; `None` si la persistencia está desactivada.
pub fn build_sink(backend: &BackendConfig) -> Result<Option<Box<dyn StorageSink>>, SinkError> {
    let sink: Box<dyn StorageSink> = match backend {
        BackendConfig::Sqlite { path } => Box::new(SqliteSink::open(path)?),
        BackendConfig::Csv { path } => Box::new(CsvSink::open(path)?),
        BackendConfig::Influxdb {
            url,
            token,
            org,
            bucket,
            timeout_ms,
        } => Box::new(InfluxSink::new(
            url,
            token,
            org,
            bucket,
            std::time::Duration::from_millis(*timeout_ms),
        )?),
        BackendConfig::None => {
            info!("🚫 Persistencia desactivada (backend none)");
            return Ok(None);
        }
    };
    info!("💾 Almacenamiento inicializado: {}", sink.kind());
    Ok(Some(sink))
}
