use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

/// Read a configuration value from the environment, falling back to the
/// provided default if the variable is unset or fails to parse. Parse
/// failures are logged rather than fatal so a bad override cannot keep the
/// process from starting.
pub fn env_config<T: FromStr + Debug>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => match value.parse::<T>() {
            Ok(parsed) => {
                tracing::info!("Overriding {name} to {parsed:?} from environment");
                parsed
            },
            Err(_) => {
                tracing::error!("Failed to parse {name}={value}, using default {default:?}");
                default
            },
        },
        Err(_) => default,
    }
}
