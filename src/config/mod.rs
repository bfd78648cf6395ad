mod settings;

pub use settings::{
    AuthConfig, JwtConfig, ServerConfig, Settings, ShutdownSettings, SignalingConfig,
};
