//! Network measurements: reachability probes and throughput tests

mod icmp;
mod throughput;

pub use icmp::{EchoTransport, ProbeClient, Prober, SurgeTransport};
pub use throughput::{HttpSpeedTest, SpeedTestBackend, ThroughputTester};
