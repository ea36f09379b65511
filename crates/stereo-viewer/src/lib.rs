//! Stereo render-model viewer.
//!
//! Loads textured render models for tracked devices, renders them into two
//! multisampled eye framebuffers and composites both eyes side by side into
//! the window surface.

pub mod app;
pub mod camera;
pub mod config;
pub mod model;
pub mod renderer;
pub mod tracking;
