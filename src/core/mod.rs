//! Core module containing the robot link functionality
//!
//! This module provides:
//! - Transport layer for Bluetooth serial (SPP) and BLE GATT links
//! - Device registry merging discovery across both link types
//! - Connection manager owning the single active link
//! - Command model and wire encoder
//! - Sequence executor with cooperative cancellation

pub mod command;
pub mod connection;
pub mod executor;
pub mod registry;
pub mod transport;
