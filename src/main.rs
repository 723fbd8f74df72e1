use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{error, info};

use puente_modbus::cache::{CacheBuffer, CacheSettings};
use puente_modbus::config::{self, Config};
use puente_modbus::dispatcher::{log_outcomes, Dispatcher};
use puente_modbus::flush_worker::spawn_flush_worker;
use puente_modbus::shutdown::shutdown_channel;
use puente_modbus::sink::build_sink;

struct Args {
    config_path: String,
    export_dead_letters: Option<PathBuf>,
}

/// `puente_modbus [config.toml] [--export-dead-letters salida.csv]`
fn parse_args() -> Result<Args> {
    let mut config_path = None;
    let mut export_dead_letters = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--export-dead-letters" {
            let path = args
                .next()
                .context("--export-dead-letters requiere una ruta de salida")?;
            export_dead_letters = Some(PathBuf::from(path));
        } else if config_path.is_none() {
            config_path = Some(arg);
        } else {
            bail!("Argumento no reconocido: {}", arg);
        }
    }
    Ok(Args {
        config_path: config_path.unwrap_or_else(|| "config.toml".to_string()),
        export_dead_letters,
    })
}

fn main() -> Result<()> {
    config::init_logging();

    let args = parse_args()?;
    info!("📄 Cargando configuración desde {}", args.config_path);
    let config = Config::load_or_default(&args.config_path)?;
    config.log_config();

    if let Some(out) = args.export_dead_letters {
        return export_dead_letters(&config, &out);
    }

    let (signal, listener) = shutdown_channel();
    let signal = Arc::new(signal);
    {
        let signal = signal.clone();
        ctrlc::set_handler(move || {
            info!("🛑 Señal de parada recibida");
            signal.trigger();
        })
        .context("No se pudo instalar el manejador de Ctrl-C")?;
    }

    // ⚙️ Abrir puertos serie
    let mut dispatcher = Dispatcher::new(config.ports.clone(), config.pacing());
    let connected = dispatcher.connect_all();
    if connected == 0 {
        bail!("No se pudo abrir ningún puerto serie");
    }
    info!("🔌 {}/{} puertos conectados", connected, config.ports.len());

    // 💾 Almacenamiento con caché local delante
    let cache = match build_sink(&config.storage.backend)
        .context("No se pudo inicializar el almacenamiento")?
    {
        Some(sink) => Some(
            CacheBuffer::open(
                &config.storage.cache.path,
                sink,
                CacheSettings::from(&config.storage.cache),
            )
            .context("No se pudo abrir la caché local")?,
        ),
        None => None,
    };
    let worker = match &cache {
        Some(cache) => Some(
            spawn_flush_worker(
                cache.clone(),
                config.storage.cache.flush_interval(),
                listener.clone(),
            )
            .context("No se pudo lanzar el hilo de flush")?,
        ),
        None => None,
    };

    info!(
        "✅ Leyendo {} sensores cada {} s",
        config.sensors.len(),
        config.read_interval_secs
    );
    loop {
        let outcomes = dispatcher.poll_all(&config.sensors);
        let correctas = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!("📊 Ciclo de lectura: {}/{} correctas", correctas, outcomes.len());
        log_outcomes(&outcomes);

        if let Some(cache) = &cache {
            for reading in outcomes.iter().filter_map(|o| o.result.as_ref().ok()) {
                if let Err(e) = cache.ingest(reading) {
                    error!("❌ No se pudo guardar {} en la caché: {}", reading.sensor_name, e);
                }
            }
        }

        if listener.wait(config.read_interval()) {
            break;
        }
    }

    info!("🧹 Deteniendo...");
    if let Some(worker) = worker {
        worker.join();
    }
    dispatcher.close_all();
    if let Some(cache) = cache {
        cache.close();
    }
    info!("👋 Finalizado");
    Ok(())
}

fn export_dead_letters(config: &Config, out: &Path) -> Result<()> {
    let sink = build_sink(&config.storage.backend)
        .context("No se pudo inicializar el almacenamiento")?
        .context("El backend none no usa caché local")?;
    let cache = CacheBuffer::open(
        &config.storage.cache.path,
        sink,
        CacheSettings::from(&config.storage.cache),
    )
    .context("No se pudo abrir la caché local")?;

    let exportadas = cache
        .export_dead_letters(out)
        .with_context(|| format!("No se pudo exportar a {}", out.display()))?;
    info!("📤 Exportación terminada: {} entradas", exportadas);
    cache.close();
    Ok(())
}
