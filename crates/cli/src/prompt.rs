//! Interactive confirmation with a non-interactive fallback

use async_trait::async_trait;
use console::Term;
use posa_core::Confirm;

/// Asks on the terminal. Declines when stdin/stdout is not a terminal.
pub struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        if !Term::stdout().is_term() {
            tracing::warn!("not a terminal, declining purge (pass --yes to skip the prompt)");
            return false;
        }

        // Run blocking cliclack prompt in spawn_blocking
        let message = prompt.to_string();
        let answer = tokio::task::spawn_blocking(move || cliclack::confirm(&message).initial_value(false).interact())
            .await;

        match answer {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(e)) => {
                tracing::warn!("prompt failed: {}", e);
                false
            }
            Err(e) => {
                tracing::warn!("prompt task failed: {}", e);
                false
            }
        }
    }
}
