pub mod models {
    pub mod mnet;
}

pub mod client;
pub mod config;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod utils;
pub mod services {
    pub mod climate;
    pub mod devices;
    pub mod presets;
    pub mod scheduler;
    pub mod simulator;
    pub mod version;
}

#[cfg(test)]
mod testing;
