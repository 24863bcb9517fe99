//! Core types and configuration for kiln.
//!
//! This crate defines the `kiln.toml` schema ([`KilnConfig`]), the build
//! recipe types ([`ImageRef`], [`WorkDir`], [`DependencyManifest`]), the
//! launch command model ([`LaunchCommand`], [`EntryPoint`], [`BindTarget`]),
//! exit codes, and shared error types.

pub mod config;
pub mod error;
pub mod exit;
pub mod image_ref;
pub mod launch;
pub mod manifest;

pub use config::{
    CONFIG_FILE, EngineConfig, ImageConfig, InstallConfig, KilnConfig, LaunchConfig, StoreConfig,
};
pub use error::{Error, Result};
pub use image_ref::{ImageRef, WorkDir};
pub use launch::{BindTarget, EntryPoint, LaunchCommand, LaunchPlan};
pub use manifest::{DependencyManifest, Requirement};
