//! # nelson-heart
//!
//! The cycle/epoch/beat scheduler for the Nelson daemon.

mod heart;

pub use heart::{
    generate_personality, Heart, HeartCommand, HeartConfig, HeartEvent, HeartMonitor,
    HeartSnapshot,
};
