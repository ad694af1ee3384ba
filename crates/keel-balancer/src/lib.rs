//! keel-balancer — request-time instance selection for Keel.
//!
//! Three layers, consulted in order for every request:
//!
//! 1. **Traffic split** — the endpoint's [`TrafficRoute`](keel_state::TrafficRoute)
//!    decides between the stable and canary version groups.
//! 2. **Circuit breakers** — instances whose breaker is open are skipped.
//! 3. **Load balancer** — one of four strategies picks from what remains.

pub mod circuit_breaker;
pub mod error;
pub mod load_balancer;
pub mod routing;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use error::{RoutingError, RoutingResult};
pub use load_balancer::{LoadBalancer, RoundRobinCursor, eligible};
pub use routing::Router;
