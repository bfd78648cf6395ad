mod authenticator;
mod claims;
mod coordinator;
mod jwt;

pub use authenticator::{
    create_authenticator, outcome_channel, AuthOutcome, Authenticator, JwtAuthenticator,
    StaticAuthenticator,
};
pub use claims::{Claims, Subject};
pub use coordinator::{AuthCoordinator, AuthStatus};
pub use jwt::JwtValidator;
