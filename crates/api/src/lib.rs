//! HTTP API for submitting document analyses and reading their outcome.

pub mod app;
