use std::time::Duration;
use crate::config::NetworkSimulation;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimulatedFate {
    Lost,
    Delayed(Duration),
}

impl NetworkSimulation {
    pub fn fate(&self) -> SimulatedFate {
        self.fate_for(rand::random(), rand::random())
    }

    /// `loss_roll` and `jitter_roll` are uniformly distributed in `0.0..1.0`
    fn fate_for(&self, loss_roll: f64, jitter_roll: f64) -> SimulatedFate {
        if loss_roll < self.loss_probability {
            return SimulatedFate::Lost;
        }
        SimulatedFate::Delayed(self.latency + self.jitter.mul_f64(jitter_roll))
    }
}
