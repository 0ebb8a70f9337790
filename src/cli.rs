//! Interface de linha de comando do rq baseada em clap.
//!
//! Define a struct [`Cli`] com o caminho da fila, os subcomandos [`Command`]
//! (create, submit, status, query, list, delete, feed, shutdown) e a flag
//! global --verbose.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::FeedOverrides;
use crate::state_machine::JobId;

/// rq: fila de jobs persistente com daemon alimentador.
#[derive(Debug, Parser)]
#[command(name = "rq", version, about)]
pub struct Cli {
    /// Diretório da fila (criado por `rq <fila> create`).
    pub queue: PathBuf,

    #[command(subcommand)]
    pub command: Command,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cria uma fila vazia no caminho indicado.
    Create,

    /// Submete um ou mais comandos; `-` lê um comando por linha da entrada padrão.
    Submit {
        /// Linhas de comando a executar.
        #[arg(required = true)]
        commands: Vec<String>,

        /// Etiqueta livre anexada aos jobs.
        #[arg(long)]
        tag: Option<String>,
    },

    /// Mostra as contagens de jobs por estado em YAML.
    Status,

    /// Lista jobs que casam com termos `chave=valor` (state, tag, id).
    Query {
        /// Termos do filtro, ex.: `state=pending`.
        #[arg(required = true)]
        filter: Vec<String>,
    },

    /// Lista todos os jobs.
    List {
        /// Inclui jobs removidos.
        #[arg(long)]
        all: bool,
    },

    /// Remove jobs pendentes.
    Delete {
        /// Ids dos jobs.
        #[arg(required = true)]
        ids: Vec<JobId>,
    },

    /// Inicia o daemon que executa os jobs pendentes.
    Feed(FeedArgs),

    /// Pede ao daemon que pare de aceitar novos jobs.
    Shutdown,
}

#[derive(Debug, Args)]
pub struct FeedArgs {
    /// Desanexa o feeder do terminal.
    #[arg(long, conflicts_with = "attached")]
    pub daemon: bool,

    /// Força execução anexada (usado pelo processo desanexado).
    #[arg(long, hide = true)]
    pub attached: bool,

    /// Arquivo de log do feeder.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Máximo de jobs simultâneos.
    #[arg(long, alias = "max_feed")]
    pub max_feed: Option<usize>,

    /// Pausa mínima entre ciclos, em segundos.
    #[arg(long, alias = "min_sleep")]
    pub min_sleep: Option<f64>,

    /// Pausa máxima entre ciclos, em segundos.
    #[arg(long, alias = "max_sleep")]
    pub max_sleep: Option<f64>,
}

impl FeedArgs {
    pub fn overrides(&self) -> FeedOverrides {
        let daemon = if self.attached {
            Some(false)
        } else if self.daemon {
            Some(true)
        } else {
            None
        };
        FeedOverrides {
            max_feed: self.max_feed,
            min_sleep: self.min_sleep,
            max_sleep: self.max_sleep,
            log: self.log.clone(),
            daemon,
        }
    }
}
