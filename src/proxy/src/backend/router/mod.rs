use crate::backend::BackendInstance;

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    #[default]
    FirstAvailable,
    RoundRobin,
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first-available" | "first_available" => Ok(RoutingStrategy::FirstAvailable),
            "round-robin" | "round_robin" => Ok(RoutingStrategy::RoundRobin),
            other => Err(format!("unknown routing strategy {other:?}")),
        }
    }
}

/// Picks the next upstream for a route.
pub struct DestinationRouter {
    destinations: Vec<BackendInstance>,
    strategy: RoutingStrategy,
    next: AtomicUsize,
}

impl DestinationRouter {
    pub fn new(destinations: Vec<BackendInstance>, strategy: RoutingStrategy) -> Self {
        Self {
            destinations,
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    pub fn destinations(&self) -> &[BackendInstance] {
        &self.destinations
    }

    /// Destination order to try for a new backend connection. The caller
    /// walks the list until a connect succeeds.
    pub fn candidates(&self) -> Vec<BackendInstance> {
        match self.strategy {
            RoutingStrategy::FirstAvailable => self.destinations.clone(),
            RoutingStrategy::RoundRobin => {
                if self.destinations.is_empty() {
                    return Vec::new();
                }
                let start = self.next.fetch_add(1, Ordering::Relaxed) % self.destinations.len();
                let mut out = Vec::with_capacity(self.destinations.len());
                out.extend_from_slice(&self.destinations[start..]);
                out.extend_from_slice(&self.destinations[..start]);
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destinations() -> Vec<BackendInstance> {
        vec![
            BackendInstance::new("db-1:3306"),
            BackendInstance::new("db-2:3306"),
            BackendInstance::new("db-3:3306"),
        ]
    }

    #[test]
    fn first_available_keeps_order() {
        let router = DestinationRouter::new(destinations(), RoutingStrategy::FirstAvailable);
        assert_eq!(router.candidates()[0].addr, "db-1:3306");
        assert_eq!(router.candidates()[0].addr, "db-1:3306");
    }

    #[test]
    fn round_robin_rotates() {
        let router = DestinationRouter::new(destinations(), RoutingStrategy::RoundRobin);
        assert_eq!(router.candidates()[0].addr, "db-1:3306");
        assert_eq!(router.candidates()[0].addr, "db-2:3306");
        assert_eq!(router.candidates()[0].addr, "db-3:3306");
        assert_eq!(router.candidates()[0].addr, "db-1:3306");
    }

    #[test]
    fn strategies_parse() {
        assert_eq!(
            "round-robin".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::RoundRobin
        );
        assert_eq!(
            "first-available".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::FirstAvailable
        );
        assert!("best-effort".parse::<RoutingStrategy>().is_err());
    }
}
