use chrono::{DateTime, TimeZone, Utc};
use log::warn;

/// Longitud máxima del nombre de sensor que se persiste.
pub const MAX_SENSOR_NAME_CHARS: usize = 64;

/// Una lectura ya escalada a unidades de ingeniería.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_name: String,
    pub slave_id: u8,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(sensor_name: &str, slave_id: u8, temperature: f64, humidity: f64) -> Self {
        Self::with_timestamp(sensor_name, slave_id, temperature, humidity, Utc::now())
    }

    /// Los nombres más largos que `MAX_SENSOR_NAME_CHARS` se truncan.
    pub fn with_timestamp(
        sensor_name: &str,
        slave_id: u8,
        temperature: f64,
        humidity: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_name: bounded_name(sensor_name),
            slave_id,
            temperature,
            humidity,
            timestamp,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Reconstruye la marca de tiempo guardada en milisegundos.
pub fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn bounded_name(name: &str) -> String {
    match name.char_indices().nth(MAX_SENSOR_NAME_CHARS) {
        Some((corte, _)) => {
            warn!(
                "✂️ Nombre de sensor truncado a {} caracteres: {}",
                MAX_SENSOR_NAME_CHARS, name
            );
            name[..corte].to_string()
        }
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let nombre = "ñ".repeat(70);
        let reading = Reading::new(&nombre, 1, 20.0, 50.0);
        assert_eq!(reading.sensor_name.chars().count(), MAX_SENSOR_NAME_CHARS);

        let reading = Reading::new("camara", 1, 20.0, 50.0);
        assert_eq!(reading.sensor_name, "camara");
    }

    #[test]
    fn timestamp_survives_millisecond_storage() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let reading = Reading::with_timestamp("a", 1, 0.0, 0.0, ts);
        assert_eq!(timestamp_from_millis(reading.timestamp_millis()), ts);
    }
}
