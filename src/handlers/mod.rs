pub mod balance;
pub mod callbacks;
pub mod checkout;
pub mod health;
pub mod orders;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;
