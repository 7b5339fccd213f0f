#![recursion_limit = "256"]

pub mod anchors;
pub mod assign;
pub mod boxes;
pub mod config;
pub mod data;
pub mod debug;
pub mod detector;
pub mod error;
pub mod loss;
pub mod nms;
pub mod protonet;
pub mod segm;
pub mod targets;
