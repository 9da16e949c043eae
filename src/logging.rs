//! Logger bootstrap for host processes and the CLI
//!
//! The library itself only talks to the `log` facade. A host that loads the
//! module without installing a logger can call [`init`] to get `env_logger`
//! output filtered by `ELE_PKCS11_LOG`.

use env_logger::Env;

/// Filter variable, e.g. `ELE_PKCS11_LOG=ele_pkcs11=debug`
pub const ENV_LOG: &str = "ELE_PKCS11_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install the logger. Later calls, or a logger installed by the host, win quietly.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().filter_or(ENV_LOG, DEFAULT_FILTER))
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        log::info!("logger installed");
    }
}
