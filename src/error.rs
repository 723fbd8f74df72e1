//! Errores por sensor del ciclo de lectura.
//!
//! Cada error de lectura queda asociado a un único sensor y nunca se agrega
//! con los de otros sensores: un esclavo que no responde no afecta a los
//! demás del mismo bus.

use std::fmt;

use thiserror::Error;

use crate::frame::ProtocolError;
use crate::serial_channel::ChannelError;

/// Clasificación del fallo de una lectura.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorKind {
    Timeout,
    CrcMismatch,
    SlaveMismatch,
    FunctionMismatch,
    ExceptionResponse(u8),
    LengthMismatch,
    PortUnavailable,
    PortNotFound,
    Io,
}

impl fmt::Display for PollErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollErrorKind::Timeout => write!(f, "timeout"),
            PollErrorKind::CrcMismatch => write!(f, "crc"),
            PollErrorKind::SlaveMismatch => write!(f, "esclavo"),
            PollErrorKind::FunctionMismatch => write!(f, "función"),
            PollErrorKind::ExceptionResponse(code) => write!(f, "excepción {:#04X}", code),
            PollErrorKind::LengthMismatch => write!(f, "longitud"),
            PollErrorKind::PortUnavailable => write!(f, "puerto no disponible"),
            PollErrorKind::PortNotFound => write!(f, "puerto no encontrado"),
            PollErrorKind::Io => write!(f, "E/S"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("[{kind}] {detail}")]
pub struct PollError {
    pub kind: PollErrorKind,
    pub detail: String,
}

impl PollError {
    pub fn new(kind: PollErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Prefija el detalle con la magnitud que se estaba leyendo.
    pub fn context(mut self, what: &str) -> Self {
        self.detail = format!("{}: {}", what, self.detail);
        self
    }

    pub fn port_unavailable(port: &str) -> Self {
        Self::new(
            PollErrorKind::PortUnavailable,
            format!("puerto serie no conectado: {}", port),
        )
    }

    pub fn port_not_found(port: &str) -> Self {
        Self::new(
            PollErrorKind::PortNotFound,
            format!("puerto serie no configurado: {}", port),
        )
    }
}

impl From<ProtocolError> for PollError {
    fn from(err: ProtocolError) -> Self {
        let kind = match &err {
            ProtocolError::TooShort { .. } | ProtocolError::LengthMismatch { .. } => {
                PollErrorKind::LengthMismatch
            }
            ProtocolError::CrcMismatch { .. } => PollErrorKind::CrcMismatch,
            ProtocolError::SlaveMismatch { .. } => PollErrorKind::SlaveMismatch,
            ProtocolError::FunctionMismatch { .. } => PollErrorKind::FunctionMismatch,
            ProtocolError::Exception { code, .. } => PollErrorKind::ExceptionResponse(*code),
        };
        Self::new(kind, err.to_string())
    }
}

impl From<ChannelError> for PollError {
    fn from(err: ChannelError) -> Self {
        let kind = match &err {
            ChannelError::Timeout { .. } => PollErrorKind::Timeout,
            ChannelError::Open { .. } => PollErrorKind::PortUnavailable,
            ChannelError::Write(_) | ChannelError::Read(_) => PollErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}
