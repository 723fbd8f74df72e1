//! Codificación y validación de tramas Modbus RTU.
//!
//! Solo se implementan las funciones de lectura de registros (0x03 y 0x04).
//! Una trama RTU es: dirección de esclavo, código de función, datos y un
//! CRC16/MODBUS en little-endian al final.

use serde::Deserialize;
use thiserror::Error;

/// Longitud fija de una petición de lectura.
pub const READ_REQUEST_LEN: usize = 8;

/// Dirección + función + byte count (o código de excepción).
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Longitud de una respuesta de excepción completa.
pub const EXCEPTION_RESPONSE_LEN: usize = 5;

/// CRC16 al final de cada trama.
pub const CRC_LEN: usize = 2;
const EXCEPTION_FLAG: u8 = 0x80;

/// Funciones de lectura soportadas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCode {
    /// Read Holding Registers (0x03)
    #[default]
    Holding,
    /// Read Input Registers (0x04)
    Input,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::Holding => 0x03,
            FunctionCode::Input => 0x04,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("trama demasiado corta: {len} bytes")]
    TooShort { len: usize },

    #[error("CRC inválido: recibido {received:#06X}, calculado {computed:#06X}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("esclavo inesperado: se esperaba {expected}, respondió {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    #[error("función inesperada: se esperaba {expected:#04X}, llegó {actual:#04X}")]
    FunctionMismatch { expected: u8, actual: u8 },

    #[error("excepción Modbus {code:#04X} ({})", exception_description(*.code))]
    Exception { function: u8, code: u8 },

    #[error("longitud inválida: byte count {declared}, se esperaban {expected} bytes de datos (trama de {frame_len} bytes)")]
    LengthMismatch {
        declared: usize,
        expected: usize,
        frame_len: usize,
    },
}

/// CRC16/MODBUS: semilla 0xFFFF, polinomio reflejado 0xA001, bit a bit.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Construye la petición de lectura de `register_count` registros desde `start_register`.
pub fn encode_read_request(
    slave_id: u8,
    function: FunctionCode,
    start_register: u16,
    register_count: u16,
) -> [u8; READ_REQUEST_LEN] {
    let mut frame = [0u8; READ_REQUEST_LEN];
    frame[0] = slave_id;
    frame[1] = function.code();
    frame[2..4].copy_from_slice(&start_register.to_be_bytes());
    frame[4..6].copy_from_slice(&register_count.to_be_bytes());
    let crc = crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());
    frame
}

/// Longitud total de una respuesta normal con `register_count` registros.
pub fn expected_response_len(register_count: u16) -> usize {
    RESPONSE_HEADER_LEN + 2 * usize::from(register_count) + CRC_LEN
}

/// Valida una respuesta completa y devuelve los registros decodificados.
///
/// El orden de las comprobaciones importa: primero la longitud mínima y el
/// CRC, de modo que una trama corrupta nunca se interpreta como excepción
/// ni como datos.
pub fn decode_read_response(
    frame: &[u8],
    expected_slave: u8,
    expected_function: FunctionCode,
    expected_registers: u16,
) -> Result<Vec<u16>, ProtocolError> {
    if frame.len() < EXCEPTION_RESPONSE_LEN {
        return Err(ProtocolError::TooShort { len: frame.len() });
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(ProtocolError::CrcMismatch { received, computed });
    }

    if body[0] != expected_slave {
        return Err(ProtocolError::SlaveMismatch {
            expected: expected_slave,
            actual: body[0],
        });
    }

    let function = expected_function.code();
    if body[1] == function | EXCEPTION_FLAG {
        return Err(ProtocolError::Exception {
            function,
            code: body[2],
        });
    }
    if body[1] != function {
        return Err(ProtocolError::FunctionMismatch {
            expected: function,
            actual: body[1],
        });
    }

    let declared = usize::from(body[2]);
    let expected = 2 * usize::from(expected_registers);
    if declared != expected || body.len() != RESPONSE_HEADER_LEN + declared {
        return Err(ProtocolError::LengthMismatch {
            declared,
            expected,
            frame_len: frame.len(),
        });
    }

    Ok(body[RESPONSE_HEADER_LEN..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Indica si la cabecera recibida corresponde a una respuesta de excepción.
pub fn is_exception_header(header: &[u8]) -> bool {
    header.len() >= 2 && header[1] & EXCEPTION_FLAG != 0
}

/// Texto legible para los códigos de excepción estándar.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "función ilegal",
        0x02 => "dirección de datos ilegal",
        0x03 => "valor de datos ilegal",
        0x04 => "fallo del dispositivo esclavo",
        0x05 => "reconocido, procesando",
        0x06 => "dispositivo esclavo ocupado",
        0x08 => "error de paridad de memoria",
        0x0A => "ruta de gateway no disponible",
        0x0B => "el dispositivo destino no respondió",
        _ => "código desconocido",
    }
}

/// Construye una respuesta normal como la enviaría un esclavo.
#[cfg(test)]
pub(crate) fn build_response(slave_id: u8, function: u8, registers: &[u16]) -> Vec<u8> {
    let mut frame = vec![slave_id, function, (registers.len() * 2) as u8];
    for reg in registers {
        frame.extend_from_slice(&reg.to_be_bytes());
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Construye una respuesta de excepción como la enviaría un esclavo.
#[cfg(test)]
pub(crate) fn build_exception(slave_id: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave_id, function | EXCEPTION_FLAG, code];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}
