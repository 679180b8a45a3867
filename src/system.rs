// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Clock, heartbeat and process control seen by the engine
pub trait System {
    /// True once per heartbeat period
    fn has_beaten(&mut self) -> bool;

    /// Milliseconds since the previous call
    fn elapsed_time(&mut self) -> u32;

    fn sleep(&mut self, millis: u32);

    /// Ask the gateway to shut down after the current tick
    fn exit(&mut self);

    fn exit_requested(&self) -> bool;
}

/// Wall clock implementation.
///
/// The engine runs inside the async gateway loop, so `sleep` does not block:
/// it is accumulated and awaited by the loop after exit, which lets the
/// broker link task flush the gateway will and DISCONNECT.
#[derive(Debug)]
pub struct GatewaySystem {
    heartbeat: Duration,
    last_beat: Instant,
    last_elapsed: Instant,
    linger: Duration,
    exit_requested: bool,
}

impl GatewaySystem {
    pub fn new(heartbeat: Duration) -> Self {
        let now = Instant::now();
        Self {
            heartbeat,
            last_beat: now,
            last_elapsed: now,
            linger: Duration::ZERO,
            exit_requested: false,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        self.heartbeat
    }

    /// Sleep requested before exit
    pub fn linger(&self) -> Duration {
        self.linger
    }
}

impl System for GatewaySystem {
    fn has_beaten(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_beat) >= self.heartbeat {
            self.last_beat = now;
            true
        } else {
            false
        }
    }

    fn elapsed_time(&mut self) -> u32 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_elapsed);
        self.last_elapsed = now;
        u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX)
    }

    fn sleep(&mut self, millis: u32) {
        debug!("Deferring {millis} ms sleep until shutdown");
        self.linger += Duration::from_millis(u64::from(millis));
    }

    fn exit(&mut self) {
        if !self.exit_requested {
            info!("Gateway exit requested");
        }
        self.exit_requested = true;
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested
    }
}
