use serde::{self, Deserialize, Deserializer};
use serialport::{DataBits, Parity, StopBits};

/// Valor de configuración que puede escribirse como número o como texto.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumeroOTexto {
    Numero(u64),
    Texto(String),
}

impl NumeroOTexto {
    fn into_text(self) -> String {
        match self {
            NumeroOTexto::Numero(n) => n.to_string(),
            NumeroOTexto::Texto(s) => s.trim().to_string(),
        }
    }
}

pub fn deserialize_data_bits<'de, D>(deserializer: D) -> Result<DataBits, D::Error>
where
    D: Deserializer<'de>,
{
    let s = NumeroOTexto::deserialize(deserializer)?.into_text();
    match s.as_str() {
        "5" => Ok(DataBits::Five),
        "6" => Ok(DataBits::Six),
        "7" => Ok(DataBits::Seven),
        "8" => Ok(DataBits::Eight),
        _ => Err(serde::de::Error::custom(format!("data_bits inválido: {}", s))),
    }
}

pub fn deserialize_parity<'de, D>(deserializer: D) -> Result<Parity, D::Error>
where
    D: Deserializer<'de>,
{
    let s = NumeroOTexto::deserialize(deserializer)?.into_text();
    match s.to_lowercase().as_str() {
        "none" | "n" => Ok(Parity::None),
        "odd" | "o" => Ok(Parity::Odd),
        "even" | "e" => Ok(Parity::Even),
        _ => Err(serde::de::Error::custom(format!("parity inválido: {}", s))),
    }
}

pub fn deserialize_stop_bits<'de, D>(deserializer: D) -> Result<StopBits, D::Error>
where
    D: Deserializer<'de>,
{
    let s = NumeroOTexto::deserialize(deserializer)?.into_text();
    match s.as_str() {
        "1" => Ok(StopBits::One),
        "2" => Ok(StopBits::Two),
        _ => Err(serde::de::Error::custom(format!("stop_bits inválido: {}", s))),
    }
}

pub fn data_bits_number(data_bits: DataBits) -> u8 {
    match data_bits {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => 8,
    }
}

pub fn stop_bits_number(stop_bits: StopBits) -> u8 {
    match stop_bits {
        StopBits::One => 1,
        StopBits::Two => 2,
    }
}

/// Letra de paridad al estilo 8N1 para los logs.
pub fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Odd => 'O',
        Parity::Even => 'E',
    }
}

/// Convierte una trama binaria en hexadecimal legible para logs.
pub fn format_frame(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
