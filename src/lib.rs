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

//! MQTT-SN to MQTT gateway.
//!
//! Datagrams from sensor clients are decoded in [`packet`], dispatched by
//! [`router::Router`] and applied by [`engine::Engine`] to the
//! [`session_store::SessionStore`]. The engine reaches the MQTT broker through
//! a [`broker_bridge::BrokerBridge`] and clients through a
//! [`transport::Transport`].

pub mod broker_bridge;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod packet;
pub mod persistence;
pub mod router;
pub mod session_store;
pub mod system;
pub mod tracing_setup;
pub mod transport;
