//! Lectura completa (temperatura + humedad) de un sensor sobre un canal.

use std::time::{Duration, Instant};

use log::debug;
use serde::Deserialize;

use crate::config::SensorConfig;
use crate::error::PollError;
use crate::frame::{
    decode_read_response, encode_read_request, is_exception_header,
    FunctionCode, CRC_LEN, EXCEPTION_RESPONSE_LEN, RESPONSE_HEADER_LEN,
};
use crate::reading::Reading;
use crate::serial_channel::Channel;

/// Cómo se piden los dos registros al esclavo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStrategy {
    /// Una petición de un registro para cada magnitud.
    #[default]
    Separate,
    /// Una sola petición de dos registros si las direcciones son contiguas.
    Combined,
}

/// Lee temperatura y humedad del sensor y aplica los factores de escala.
pub fn read(sensor: &SensorConfig, channel: &mut Channel) -> Result<Reading, PollError> {
    let (temp_raw, humi_raw) = match sensor.read_mode {
        ReadStrategy::Combined => match combined_layout(sensor) {
            Some((start, temp_idx, humi_idx)) => {
                let regs = read_registers(channel, sensor.slave_id, sensor.function, start, 2)
                    .map_err(|e| e.context("temperatura+humedad"))?;
                (regs[temp_idx], regs[humi_idx])
            }
            None => {
                debug!(
                    "Registros de {} no contiguos, se leen por separado",
                    sensor.name
                );
                read_separately(sensor, channel)?
            }
        },
        ReadStrategy::Separate => read_separately(sensor, channel)?,
    };

    let temperature = scale(temp_raw, sensor.temp_scale, sensor.signed_temperature);
    let humidity = scale(humi_raw, sensor.humi_scale, false);
    debug!(
        "🌡️ {} (esclavo {}): crudo T={} H={} -> {:.1} / {:.1}",
        sensor.name, sensor.slave_id, temp_raw, humi_raw, temperature, humidity
    );

    Ok(Reading::new(&sensor.name, sensor.slave_id, temperature, humidity))
}

fn read_separately(sensor: &SensorConfig, channel: &mut Channel) -> Result<(u16, u16), PollError> {
    let temp = read_registers(channel, sensor.slave_id, sensor.function, sensor.temp_register, 1)
        .map_err(|e| e.context("temperatura"))?;
    let humi = read_registers(channel, sensor.slave_id, sensor.function, sensor.humi_register, 1)
        .map_err(|e| e.context("humedad"))?;
    Ok((temp[0], humi[0]))
}

/// Dirección inicial e índices de temperatura y humedad en una lectura de dos registros.
fn combined_layout(sensor: &SensorConfig) -> Option<(u16, usize, usize)> {
    if sensor.temp_register.checked_add(1) == Some(sensor.humi_register) {
        Some((sensor.temp_register, 0, 1))
    } else if sensor.humi_register.checked_add(1) == Some(sensor.temp_register) {
        Some((sensor.humi_register, 1, 0))
    } else {
        None
    }
}

/// Una transacción completa: petición, cabecera, resto de la trama y validación.
///
/// La cabecera se lee primero: una excepción mide 5 bytes y una respuesta
/// normal se dimensiona con el byte count que declara el esclavo, así una
/// longitud errónea llega al decodificador en vez de agotar el plazo.
/// Ambas lecturas comparten el mismo plazo.
pub fn read_registers(
    channel: &mut Channel,
    slave_id: u8,
    function: FunctionCode,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, PollError> {
    let request = encode_read_request(slave_id, function, start, count);
    channel.transmit(&request)?;

    let deadline = Instant::now() + channel.response_timeout();
    let mut frame = channel.receive(RESPONSE_HEADER_LEN, remaining(deadline))?;
    let rest = if is_exception_header(&frame) {
        EXCEPTION_RESPONSE_LEN - RESPONSE_HEADER_LEN
    } else {
        usize::from(frame[2]) + CRC_LEN
    };
    frame.extend(channel.receive(rest, remaining(deadline))?);

    Ok(decode_read_response(&frame, slave_id, function, count)?)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn scale(raw: u16, factor: f64, signed: bool) -> f64 {
    let value = if signed {
        f64::from(raw as i16)
    } else {
        f64::from(raw)
    };
    value * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PollErrorKind;
    use crate::frame::{build_exception, build_response};
    use crate::serial_channel::testing::SimulatedSlave;

    /// Esclavo con un mapa de registros que responde a 0x03/0x04.
    fn register_slave(slave_id: u8, registers: Vec<u16>) -> SimulatedSlave {
        SimulatedSlave::new(move |req| {
            if req[0] != slave_id {
                return Vec::new();
            }
            let start = usize::from(u16::from_be_bytes([req[2], req[3]]));
            let count = usize::from(u16::from_be_bytes([req[4], req[5]]));
            match registers.get(start..start + count) {
                Some(values) => build_response(slave_id, req[1], values),
                None => build_exception(slave_id, req[1], 0x02),
            }
        })
    }

    fn channel(slave: SimulatedSlave) -> Channel {
        Channel::from_transport("bus1", "/dev/null", Duration::from_millis(80), Box::new(slave))
    }

    fn sensor(temp_register: u16, humi_register: u16, read_mode: ReadStrategy) -> SensorConfig {
        SensorConfig {
            name: "camara".to_string(),
            port: "bus1".to_string(),
            slave_id: 5,
            temp_register,
            humi_register,
            temp_scale: 0.1,
            humi_scale: 0.1,
            function: FunctionCode::Holding,
            read_mode,
            signed_temperature: false,
        }
    }

    #[test]
    fn separate_strategy_issues_two_requests() {
        let slave = register_slave(5, vec![253, 618, 0, 0]);
        let requests = slave.requests.clone();
        let mut ch = channel(slave);

        let reading = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap();
        assert!((reading.temperature - 25.3).abs() < 1e-9);
        assert!((reading.humidity - 61.8).abs() < 1e-9);
        assert_eq!(reading.slave_id, 5);

        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], encode_read_request(5, FunctionCode::Holding, 0, 1).to_vec());
        assert_eq!(requests[1], encode_read_request(5, FunctionCode::Holding, 1, 1).to_vec());
    }

    #[test]
    fn combined_strategy_reads_adjacent_registers_once() {
        let slave = register_slave(5, vec![0, 0, 450, 201]);
        let requests = slave.requests.clone();
        let mut ch = channel(slave);

        // Humedad en 2, temperatura en 3
        let reading = read(&sensor(3, 2, ReadStrategy::Combined), &mut ch).unwrap();
        assert!((reading.temperature - 20.1).abs() < 1e-9);
        assert!((reading.humidity - 45.0).abs() < 1e-9);

        let requests = requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], encode_read_request(5, FunctionCode::Holding, 2, 2).to_vec());
    }

    #[test]
    fn combined_strategy_falls_back_when_not_adjacent() {
        let slave = register_slave(5, vec![100, 0, 0, 300]);
        let requests = slave.requests.clone();
        let mut ch = channel(slave);

        let reading = read(&sensor(0, 3, ReadStrategy::Combined), &mut ch).unwrap();
        assert!((reading.humidity - 30.0).abs() < 1e-9);
        assert_eq!(requests.lock().len(), 2);
    }

    #[test]
    fn exception_reply_is_tagged() {
        let slave = SimulatedSlave::new(|req| build_exception(req[0], req[1], 0x02));
        let mut ch = channel(slave);
        let err = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::ExceptionResponse(0x02));
        assert!(err.detail.starts_with("temperatura"));
    }

    #[test]
    fn humidity_failure_aborts_the_read() {
        let slave = register_slave(5, vec![200]);
        let mut ch = channel(slave);
        let err = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::ExceptionResponse(0x02));
        assert!(err.detail.starts_with("humedad"));
    }

    #[test]
    fn silent_slave_times_out() {
        let slave = register_slave(9, vec![1, 2]);
        let mut ch = channel(slave);
        let err = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::Timeout);
    }

    #[test]
    fn corrupted_reply_is_a_crc_error() {
        let slave = SimulatedSlave::new(|req| {
            let mut frame = build_response(req[0], req[1], &[42]);
            frame[3] ^= 0x10;
            frame
        });
        let mut ch = channel(slave);
        let err = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::CrcMismatch);
    }

    #[test]
    fn short_byte_count_is_a_length_error() {
        // Pide dos registros y el esclavo declara solo uno, con CRC válido
        let slave = SimulatedSlave::new(|req| build_response(req[0], req[1], &[250]));
        let mut ch = channel(slave);

        let started = Instant::now();
        let err = read(&sensor(0, 1, ReadStrategy::Combined), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::LengthMismatch);
        assert!(err.detail.starts_with("temperatura+humedad"));
        assert!(started.elapsed() < ch.response_timeout());
    }

    #[test]
    fn reply_from_other_slave_is_rejected() {
        let slave = SimulatedSlave::new(|req| build_response(req[0] + 1, req[1], &[42]));
        let mut ch = channel(slave);
        let err = read(&sensor(0, 1, ReadStrategy::Separate), &mut ch).unwrap_err();
        assert_eq!(err.kind, PollErrorKind::SlaveMismatch);
    }

    #[test]
    fn signed_temperature_is_twos_complement() {
        let slave = register_slave(5, vec![0xFF9C, 500]);
        let mut ch = channel(slave);
        let mut config = sensor(0, 1, ReadStrategy::Separate);
        config.signed_temperature = true;
        let reading = read(&config, &mut ch).unwrap();
        assert!((reading.temperature + 10.0).abs() < 1e-9);
    }
}
