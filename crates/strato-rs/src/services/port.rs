//! Automatic port acquisition.
//!
//! Probes the desired port by attempting to bind it. When the port is
//! taken, the configured strategy picks the next candidate — incrementing
//! or random within the ephemeral range — up to the attempt budget. The
//! chosen port is logged as a port-switch event so operators can see the
//! divergence from configuration; workers receive the final port through
//! their environment.

use crate::models::config::{AutoPortSwitch, PortStrategy};
use crate::models::error::AppError;
use log::{info, warn};
use rand::Rng;
use std::net::TcpListener;

/// Lower bound of the range the random strategy draws from.
const RANDOM_PORT_FLOOR: u16 = 10_000;

/// A successful acquisition: the port and whether it differs from the
/// requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredPort {
    pub port: u16,
    pub switched: bool,
}

pub struct PortAcquirer;

impl PortAcquirer {
    /// Checks whether `port` can be bound on `host` right now.
    pub fn is_free(host: &str, port: u16) -> bool {
        TcpListener::bind((host, port)).is_ok()
    }

    /// Acquires a port near `desired` following the switch policy. With
    /// switching disabled (or `max_attempts` of 1) only the desired port
    /// is probed.
    pub fn acquire(
        host: &str,
        desired: u16,
        policy: &AutoPortSwitch,
    ) -> Result<AcquiredPort, AppError> {
        let attempts = if policy.enabled {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut candidate = desired;
        let mut rng = rand::thread_rng();
        for attempt in 0..attempts {
            if Self::is_free(host, candidate) {
                if candidate != desired {
                    // Port-switch event: the server will not be where the
                    // configuration says it is.
                    info!(
                        "port switch: desired {} was busy, acquired {}",
                        desired, candidate
                    );
                }
                return Ok(AcquiredPort {
                    port: candidate,
                    switched: candidate != desired,
                });
            }
            warn!(
                "port {} unavailable (attempt {}/{})",
                candidate,
                attempt + 1,
                attempts
            );
            candidate = match policy.strategy {
                PortStrategy::Increment => desired.saturating_add(attempt as u16 + 1),
                PortStrategy::Random => rng.gen_range(RANDOM_PORT_FLOOR..u16::MAX),
            };
        }

        Err(AppError::PortAcquisition {
            desired,
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(enabled: bool, max_attempts: u32, strategy: PortStrategy) -> AutoPortSwitch {
        AutoPortSwitch {
            enabled,
            max_attempts,
            strategy,
        }
    }

    #[test]
    fn free_port_is_acquired_unchanged() {
        // Bind port 0 to discover a port, then release it and acquire it.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let acquired = PortAcquirer::acquire(
            "127.0.0.1",
            port,
            &policy(false, 1, PortStrategy::Increment),
        )
        .unwrap();
        assert_eq!(acquired.port, port);
        assert!(!acquired.switched);
    }

    #[test]
    fn single_attempt_fails_on_occupied_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = PortAcquirer::acquire(
            "127.0.0.1",
            port,
            &policy(true, 1, PortStrategy::Increment),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::PortAcquisition { attempts: 1, .. }));
    }

    #[test]
    fn increment_strategy_walks_consecutive_ports() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        // Only meaningful when the next port up is actually free.
        if !PortAcquirer::is_free("127.0.0.1", port + 1) {
            return;
        }
        let acquired = PortAcquirer::acquire(
            "127.0.0.1",
            port,
            &policy(true, 3, PortStrategy::Increment),
        )
        .unwrap();
        assert_eq!(acquired.port, port + 1);
        assert!(acquired.switched);
    }

    #[test]
    fn random_strategy_finds_some_port() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let acquired = PortAcquirer::acquire(
            "127.0.0.1",
            port,
            &policy(true, 16, PortStrategy::Random),
        )
        .unwrap();
        assert_ne!(acquired.port, port);
        assert!(acquired.port >= RANDOM_PORT_FLOOR);
    }

    #[test]
    fn disabled_switching_never_probes_alternatives() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = PortAcquirer::acquire(
            "127.0.0.1",
            port,
            &policy(false, 10, PortStrategy::Increment),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::PortAcquisition { attempts: 1, .. }));
    }
}
