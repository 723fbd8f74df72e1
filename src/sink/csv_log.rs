use std::fs::{File, OpenOptions};
use std::path::Path;

use chrono::Local;
use csv::{Writer, WriterBuilder};

use super::{SinkError, StorageSink};
use crate::reading::Reading;

const HEADER: [&str; 5] = ["timestamp", "sensor_name", "slave_id", "temperature", "humidity"];

/// Registro CSV en modo append; la cabecera solo se escribe en un archivo nuevo.
pub struct CsvSink {
    writer: Option<Writer<File>>,
}

impl CsvSink {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let nuevo = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if nuevo {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }
        Ok(Self {
            writer: Some(writer),
        })
    }

    fn write(&mut self, reading: &Reading) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed("csv"))?;
        writer.write_record([
            reading
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            reading.sensor_name.clone(),
            reading.slave_id.to_string(),
            format!("{:.1}", reading.temperature),
            format!("{:.1}", reading.humidity),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl StorageSink for CsvSink {
    fn kind(&self) -> &'static str {
        "csv"
    }

    fn save(&mut self, reading: &Reading) -> Result<(), SinkError> {
        self.write(reading)?;
        self.flush()
    }

    fn save_batch(&mut self, readings: &[Reading]) -> Result<(), SinkError> {
        for reading in readings {
            self.write(reading)?;
        }
        self.flush()
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}
