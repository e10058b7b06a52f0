//! USB Gadget Manager - network mode control for USB OTG devices
//!
//! This crate switches a device's USB gadget between point-to-point
//! Ethernet (with a private DHCP server) and tethering through the
//! network manager, and serializes those switches across clients.

pub mod config;
pub mod error;
pub mod events;
pub mod gadget;
pub mod network;
pub mod notify;
pub mod state;
pub mod system;
pub mod web;

#[cfg(test)]
mod testing;

pub use error::{AppError, Result};
