//! Least-loaded load balancing strategy.

use crate::discovery::ServiceInstance;
use crate::load_balancer::BalancingStrategy;

/// Least-loaded selector.
/// Selects the instance with the lowest `active / capacity` ratio.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl BalancingStrategy for LeastLoaded {
    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        // Ties keep the first-registered instance.
        instances
            .iter()
            .min_by(|a, b| a.load.ratio().total_cmp(&b.load.ratio()))
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded() {
        let lb = LeastLoaded::new();
        let big = ServiceInstance::new("ml", "10.0.0.1", 8080).with_id("big").with_capacity(10);
        let small = ServiceInstance::new("ml", "10.0.0.2", 8080).with_id("small").with_capacity(2);
        let instances = vec![big.clone(), small.clone()];

        // Equal load: first wins.
        assert_eq!(lb.select("ml", &instances).unwrap().id, "big");

        // big at 2/10, small at 1/2
        let _g1 = big.load.acquire();
        let _g2 = big.load.acquire();
        let _g3 = small.load.acquire();
        assert_eq!(lb.select("ml", &instances).unwrap().id, "big");

        // big at 6/10
        let _more: Vec<_> = (0..4).map(|_| big.load.acquire()).collect();
        assert_eq!(lb.select("ml", &instances).unwrap().id, "small");
    }
}
