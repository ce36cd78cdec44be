//! Command implementations. Each one boots a kernel, does its work and
//! exits the process with status 1 on a fatal error.

pub mod cache;
pub mod index;
pub mod recall;

use mnemos_kernel::config::load_config;
use mnemos_kernel::RecallKernel;
use mnemos_types::config::RecallConfig;
use serde::Serialize;
use std::path::Path;

/// Print a diagnostic to stderr and exit non-zero.
pub(crate) fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {msg}");
    std::process::exit(1);
}

pub(crate) fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| fail(format!("failed to start async runtime: {e}")))
}

pub(crate) fn load(config: Option<&Path>) -> RecallConfig {
    load_config(config).unwrap_or_else(|e| fail(e))
}

/// Boot a kernel. With `with_provider = false` no embedding driver is
/// created, so no key is needed and nothing leaves the machine.
pub(crate) async fn boot(config: RecallConfig, with_provider: bool) -> RecallKernel {
    let booted = if with_provider {
        RecallKernel::boot(config).await
    } else {
        RecallKernel::boot_with_driver(config, None).await
    };
    booted.unwrap_or_else(|e| fail(e))
}

pub(crate) fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => fail(format!("failed to serialize output: {e}")),
    }
}
