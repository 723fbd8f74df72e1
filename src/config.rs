use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use serde::Deserialize;
use serialport::{DataBits, Parity, StopBits};

use crate::frame::FunctionCode;
use crate::poller::ReadStrategy;
use crate::serial_utils::{data_bits_number, parity_letter, stop_bits_number};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ports: Vec<PortConfig>,
    pub sensors: Vec<SensorConfig>,
    #[serde(default = "default_read_interval_secs")]
    pub read_interval_secs: u64,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Un enlace serie físico.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    pub name: String,
    #[serde(alias = "port")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(
        default = "default_data_bits",
        deserialize_with = "crate::serial_utils::deserialize_data_bits"
    )]
    pub data_bits: DataBits,
    #[serde(
        default = "default_parity",
        deserialize_with = "crate::serial_utils::deserialize_parity"
    )]
    pub parity: Parity,
    #[serde(
        default = "default_stop_bits",
        deserialize_with = "crate::serial_utils::deserialize_stop_bits"
    )]
    pub stop_bits: StopBits,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl PortConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Un transductor de temperatura/humedad en un bus.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    #[serde(alias = "port_name")]
    pub port: String,
    pub slave_id: u8,
    pub temp_register: u16,
    pub humi_register: u16,
    #[serde(default = "default_scale")]
    pub temp_scale: f64,
    #[serde(default = "default_scale")]
    pub humi_scale: f64,
    #[serde(default)]
    pub function: FunctionCode,
    #[serde(default)]
    pub read_mode: ReadStrategy,
    /// Interpreta el registro de temperatura como complemento a dos.
    #[serde(default)]
    pub signed_temperature: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Destino final de las lecturas.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
    Csv {
        #[serde(default = "default_csv_path")]
        path: PathBuf,
    },
    Influxdb {
        #[serde(default = "default_influx_url")]
        url: String,
        #[serde(default)]
        token: String,
        org: String,
        bucket: String,
        #[serde(default = "default_http_timeout_ms")]
        timeout_ms: u64,
    },
    None,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Sqlite { .. } => "sqlite",
            BackendConfig::Csv { .. } => "csv",
            BackendConfig::Influxdb { .. } => "influxdb",
            BackendConfig::None => "none",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            flush_interval_secs: default_flush_interval_secs(),
            batch_size: default_batch_size(),
            max_retry: default_max_retry(),
        }
    }
}

impl CacheConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_read_interval_secs() -> u64 { 2 }
fn default_pacing_ms() -> u64 { 100 }
fn default_baud_rate() -> u32 { 9600 }
fn default_data_bits() -> DataBits { DataBits::Eight }
fn default_parity() -> Parity { Parity::None }
fn default_stop_bits() -> StopBits { StopBits::One }
fn default_timeout_ms() -> u64 { 1000 }
fn default_scale() -> f64 { 0.1 }
fn default_sqlite_path() -> PathBuf { PathBuf::from("sensor_data.db") }
fn default_csv_path() -> PathBuf { PathBuf::from("sensor_data.csv") }
fn default_influx_url() -> String { "http://localhost:8086".to_string() }
fn default_http_timeout_ms() -> u64 { 5000 }
fn default_cache_path() -> PathBuf { PathBuf::from("sensor_cache.db") }
fn default_flush_interval_secs() -> u64 { 10 }
fn default_batch_size() -> usize { 100 }
fn default_max_retry() -> u32 { 10 }

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Error leyendo archivo de configuración {}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| "Error parseando archivo TOML con serde")?;
        config.validate()?;
        Ok(config)
    }

    /// Carga el archivo si existe; si no, usa la configuración por defecto.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load_from_file(path)
        } else {
            warn!("⚠️ {} no existe, usando configuración por defecto", path);
            Ok(Self::default_config())
        }
    }

    /// Un puerto 9600 8N1 y tres sensores (esclavos 1 a 3).
    pub fn default_config() -> Self {
        let port_name = "default".to_string();
        let device = if cfg!(windows) { "COM3" } else { "/dev/ttyUSB0" };
        let sensors = (1..=3u8)
            .map(|slave_id| SensorConfig {
                name: format!("sensor{}", slave_id),
                port: port_name.clone(),
                slave_id,
                temp_register: 0x0000,
                humi_register: 0x0001,
                temp_scale: default_scale(),
                humi_scale: default_scale(),
                function: FunctionCode::default(),
                read_mode: ReadStrategy::default(),
                signed_temperature: false,
            })
            .collect();

        Config {
            ports: vec![PortConfig {
                name: port_name,
                device: device.to_string(),
                baud_rate: default_baud_rate(),
                data_bits: default_data_bits(),
                parity: default_parity(),
                stop_bits: default_stop_bits(),
                timeout_ms: default_timeout_ms(),
            }],
            sensors,
            read_interval_secs: default_read_interval_secs(),
            pacing_ms: default_pacing_ms(),
            storage: StorageConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.ports.is_empty(), "No hay puertos configurados");
        ensure!(!self.sensors.is_empty(), "No hay sensores configurados");
        ensure!(self.read_interval_secs > 0, "read_interval_secs debe ser mayor que 0");

        let mut nombres = HashSet::new();
        for port in &self.ports {
            if !nombres.insert(port.name.as_str()) {
                bail!("Puerto duplicado: {}", port.name);
            }
            ensure!(port.baud_rate > 0, "Baud rate inválido en {}", port.name);
            ensure!(port.timeout_ms > 0, "timeout_ms inválido en {}", port.name);
        }

        for sensor in &self.sensors {
            ensure!(!sensor.name.trim().is_empty(), "Sensor sin nombre");
            ensure!(
                (1..=247).contains(&sensor.slave_id),
                "slave_id {} fuera de rango en {}",
                sensor.slave_id,
                sensor.name
            );
            ensure!(
                sensor.temp_scale.is_finite() && sensor.humi_scale.is_finite(),
                "Factor de escala inválido en {}",
                sensor.name
            );
            if !nombres.contains(sensor.port.as_str()) {
                warn!(
                    "⚠️ El sensor {} usa el puerto {} que no está configurado",
                    sensor.name, sensor.port
                );
            }
        }

        let cache = &self.storage.cache;
        ensure!(cache.batch_size > 0, "batch_size debe ser mayor que 0");
        ensure!(cache.flush_interval_secs > 0, "flush_interval_secs debe ser mayor que 0");
        ensure!(cache.max_retry > 0, "max_retry debe ser mayor que 0");
        Ok(())
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn log_config(&self) {
        info!("📦 Configuración cargada:");
        for port in &self.ports {
            info!(
                "  Puerto {:<12}: {} {} {}{}{} timeout {} ms",
                port.name,
                port.device,
                port.baud_rate,
                data_bits_number(port.data_bits),
                parity_letter(port.parity),
                stop_bits_number(port.stop_bits),
                port.timeout_ms
            );
        }
        for sensor in &self.sensors {
            info!(
                "  Sensor {:<12}: puerto {} esclavo {} T@{:#06X}x{} H@{:#06X}x{} ({:?}, {:?})",
                sensor.name,
                sensor.port,
                sensor.slave_id,
                sensor.temp_register,
                sensor.temp_scale,
                sensor.humi_register,
                sensor.humi_scale,
                sensor.function,
                sensor.read_mode
            );
        }
        info!("  Intervalo lectura     : {} s", self.read_interval_secs);
        info!("  Pausa entre lecturas  : {} ms", self.pacing_ms);
        info!("  Almacenamiento        : {}", self.storage.backend.kind());
        info!("  Caché                 : {}", self.storage.cache.path.display());
        info!("  Flush caché (s)       : {}", self.storage.cache.flush_interval_secs);
        info!("  Tamaño de lote        : {}", self.storage.cache.batch_size);
        info!("  Reintentos máximos    : {}", self.storage.cache.max_retry);
    }
}

pub fn init_logging() {
    use env_logger::Builder;
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    const EJEMPLO: &str = r#"
read_interval_secs = 5

[[ports]]
name = "bus1"
device = "/dev/ttyUSB0"
baud_rate = 19200
data_bits = 8
parity = "E"
stop_bits = 1
timeout_ms = 500

[[ports]]
name = "bus2"
port = "/dev/ttyUSB1"

[[sensors]]
name = "camara"
port = "bus1"
slave_id = 1
temp_register = 0
humi_register = 1
function = "input"
read_mode = "combined"

[[sensors]]
name = "pasillo"
port_name = "bus2"
slave_id = 4
temp_register = 16
humi_register = 32
temp_scale = 0.01
signed_temperature = true

[storage.backend]
type = "csv"
path = "lecturas.csv"

[storage.cache]
batch_size = 20
"#;

    #[test]
    fn parses_full_file() {
        let config: Config = toml::from_str(EJEMPLO).unwrap();
        config.validate().unwrap();

        assert_eq!(config.read_interval(), Duration::from_secs(5));
        assert_eq!(config.pacing(), Duration::from_millis(100));
        assert_eq!(config.ports[0].parity, Parity::Even);
        assert_eq!(config.ports[0].timeout(), Duration::from_millis(500));
        assert_eq!(config.ports[1].device, "/dev/ttyUSB1");
        assert_eq!(config.ports[1].baud_rate, 9600);

        assert_eq!(config.sensors[0].function, FunctionCode::Input);
        assert_eq!(config.sensors[0].read_mode, ReadStrategy::Combined);
        assert_eq!(config.sensors[1].port, "bus2");
        assert!(config.sensors[1].signed_temperature);
        assert!((config.sensors[1].humi_scale - 0.1).abs() < f64::EPSILON);

        assert!(matches!(config.storage.backend, BackendConfig::Csv { ref path } if path == Path::new("lecturas.csv")));
        assert_eq!(config.storage.cache.batch_size, 20);
        assert_eq!(config.storage.cache.max_retry, 10);
        assert_eq!(config.storage.cache.flush_interval(), Duration::from_secs(10));
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default_config();
        config.validate().unwrap();
        assert_eq!(config.sensors.len(), 3);
        assert_eq!(config.storage.backend.kind(), "sqlite");
    }

    #[test]
    fn rejects_duplicate_ports_and_broadcast_slave() {
        let mut config = Config::default_config();
        config.ports.push(config.ports[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default_config();
        config.sensors[0].slave_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-existe.toml");
        let config = Config::load_or_default(path.to_str().unwrap()).unwrap();
        assert_eq!(config.ports.len(), 1);

        let path = dir.path().join("config.toml");
        fs::write(&path, EJEMPLO).unwrap();
        let config = Config::load_or_default(path.to_str().unwrap()).unwrap();
        assert_eq!(config.ports.len(), 2);
    }

    #[test]
    fn shipped_example_is_valid() {
        let config: Config = toml::from_str(include_str!("../config.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sensors[1].read_mode, ReadStrategy::Combined);
    }

    #[test]
    fn influx_backend_requires_org_and_bucket() {
        let texto = "[backend]\ntype = \"influxdb\"\ntoken = \"t\"\n";
        assert!(toml::from_str::<StorageConfig>(texto).is_err());

        let texto = "[backend]\ntype = \"influxdb\"\norg = \"o\"\nbucket = \"b\"\n";
        let storage: StorageConfig = toml::from_str(texto).unwrap();
        assert_eq!(storage.backend.kind(), "influxdb");

        let storage: StorageConfig = toml::from_str("[backend]\ntype = \"none\"\n").unwrap();
        assert!(matches!(storage.backend, BackendConfig::None));
    }
}
