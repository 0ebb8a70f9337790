//! Saída de terminal do rq: documentos YAML em stdout, mensagens em stderr.
//!
//! Usa a crate `console` para colorir as mensagens de erro e de aviso.
//! O stdout fica reservado a YAML puro para que scripts possam ler o resultado.

use console::Style;
use serde::Serialize;

/// Escreve resultados e mensagens para o usuário.
pub struct Reporter {
    // Estilo verde para confirmações.
    green: Style,
    // Estilo vermelho para erros.
    red: Style,
    // Estilo amarelo para avisos.
    yellow: Style,
}

impl Default for Reporter {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold().for_stderr(),
            red: Style::new().red().bold().for_stderr(),
            yellow: Style::new().yellow().for_stderr(),
        }
    }
}

impl Reporter {
    /// Imprime um documento YAML em stdout.
    pub fn document<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        print!("{}", render(value)?);
        Ok(())
    }

    /// Confirmação curta em stderr, com checkmark verde.
    pub fn done(&self, message: &str) {
        eprintln!("  {} {message}", self.green.apply_to("✓"));
    }

    /// Aviso em stderr; não altera o código de saída.
    pub fn warn(&self, message: &str) {
        eprintln!("  {} {message}", self.yellow.apply_to("!"));
    }

    /// Erro em stderr, com X vermelho.
    pub fn error(&self, message: &str) {
        eprintln!("  {} {message}", self.red.apply_to("✗"));
    }
}

/// Serializa para YAML, garantindo a quebra de linha final.
pub fn render<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    let mut yaml = serde_yaml::to_string(value)?;
    if !yaml.ends_with('\n') {
        yaml.push('\n');
    }
    Ok(yaml)
}
