// realtime-client/src/actors/mod.rs

pub mod channel_actor;
