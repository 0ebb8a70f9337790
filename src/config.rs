//! Configuração do feeder carregada a partir de `<fila>/rq.toml`.
//!
//! A struct [`FeedConfig`] contém todos os parâmetros do daemon.
//! Valores ausentes no arquivo usam os defaults abaixo.
//! Flags da linha de comando têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::error::QueueError;
use crate::queue::CONFIG_FILE;

/// Parâmetros do feeder: teto de concorrência, ritmo e destino do log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    /// Máximo de jobs RUNNING mantidos simultaneamente por este feeder.
    #[serde(default = "default_max_feed")]
    pub max_feed: usize,

    /// Limite inferior, em segundos, da pausa aleatória entre ciclos.
    #[serde(default = "default_min_sleep")]
    pub min_sleep: f64,

    /// Limite superior, em segundos, da pausa aleatória entre ciclos.
    #[serde(default = "default_max_sleep")]
    pub max_sleep: f64,

    /// Arquivo de log; sem ele o feeder escreve em stderr.
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Desanexa o feeder do terminal.
    #[serde(default)]
    pub daemon: bool,
}

// Valor padrão para o teto de concorrência: 1.
fn default_max_feed() -> usize {
    1
}

// Valor padrão para a pausa mínima: 42s.
fn default_min_sleep() -> f64 {
    42.0
}

// Valor padrão para a pausa máxima: 240s.
fn default_max_sleep() -> f64 {
    240.0
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            max_feed: default_max_feed(),
            min_sleep: default_min_sleep(),
            max_sleep: default_max_sleep(),
            log: None,
            daemon: false,
        }
    }
}

/// Valores vindos da linha de comando; `None` mantém o valor do arquivo.
#[derive(Debug, Clone, Default)]
pub struct FeedOverrides {
    pub max_feed: Option<usize>,
    pub min_sleep: Option<f64>,
    pub max_sleep: Option<f64>,
    pub log: Option<PathBuf>,
    pub daemon: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    feed: Option<FeedConfig>,
}

impl FeedConfig {
    /// Carrega a seção `[feed]` de `rq.toml` no diretório da fila.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(queue_root: &Path) -> Result<Self> {
        let path = queue_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let file = toml::from_str::<ConfigFile>(&contents)?;
        Ok(file.feed.unwrap_or_default())
    }

    pub fn apply(mut self, overrides: FeedOverrides) -> Self {
        if let Some(max_feed) = overrides.max_feed {
            self.max_feed = max_feed;
        }
        if let Some(min_sleep) = overrides.min_sleep {
            self.min_sleep = min_sleep;
        }
        if let Some(max_sleep) = overrides.max_sleep {
            self.max_sleep = max_sleep;
        }
        if overrides.log.is_some() {
            self.log = overrides.log;
        }
        if let Some(daemon) = overrides.daemon {
            self.daemon = daemon;
        }
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_feed == 0 {
            return Err(QueueError::InvalidArgument(
                "max_feed must be at least 1".into(),
            ));
        }
        if !self.min_sleep.is_finite() || !self.max_sleep.is_finite() || self.min_sleep < 0.0 {
            return Err(QueueError::InvalidArgument(
                "sleep bounds must be finite and non-negative".into(),
            ));
        }
        if self.min_sleep > self.max_sleep {
            return Err(QueueError::InvalidArgument(format!(
                "min_sleep ({}) exceeds max_sleep ({})",
                self.min_sleep, self.max_sleep
            )));
        }
        Ok(())
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.min_sleep)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.max_sleep)
    }

    /// Um heartbeat mais velho que isso indica um feeder morto.
    pub fn stale_after(&self) -> chrono::Duration {
        let window = self.max_sleep().saturating_mul(3).max(Duration::from_secs(30));
        chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
    }
}
