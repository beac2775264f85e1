use std::{env, fmt::Display, net::SocketAddr, str::FromStr};

use log::{info, warn};

pub struct Config {
    pub bind_addr: SocketAddr,
    /// Capacity of each connection's outbound delta queue; overflow forces
    /// that subscriber onto a fresh snapshot instead of buffering further.
    pub outbound_queue_capacity: usize,
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            bind_addr: try_load("BIND_ADDR", "0.0.0.0:3000"),
            outbound_queue_capacity: try_load("OUTBOUND_QUEUE_CAPACITY", "64"),
            sweep_interval_seconds: try_load("SWEEP_INTERVAL_SECONDS", "60"),
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    env::var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_is_unset() {
        let capacity: usize = try_load("POLLSTREAM_TEST_UNSET_VAR", "64");
        assert_eq!(capacity, 64);
    }
}
