pub mod authorize;
pub mod backchannel;
pub mod config;
pub mod error;
pub mod external;
pub mod interaction;
pub mod session;
pub mod token;
