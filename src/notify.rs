use colored::*;
use log::info;

/// Short user-facing notices ("Download failed.", "Reloading songs...").
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Prints notices to stderr.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, message: &str) {
        info!("Notice: {}", message);
        eprintln!("{} {}", "»".yellow(), message);
    }
}
