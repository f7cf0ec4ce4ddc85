pub mod routes;

// Re-export route handlers for convenience
pub use routes::runs;
pub use routes::schedules;
pub use routes::settings;
pub use routes::state;
