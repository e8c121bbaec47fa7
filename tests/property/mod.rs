// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests Module
//!
//! - `publish_routing`: rows land in the mapped table, never elsewhere
//! - `delivery_order`: deliveries follow ordering tokens and offsets only grow

mod delivery_order;
mod publish_routing;
