//! World-level metadata shared by every provider format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar world state persisted alongside the chunks: identity, clock,
/// spawn, difficulty, weather timers, and the generator binding.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelData {
    pub name: String,
    pub seed: i64,
    pub time: i64,
    pub spawn: (i32, i32, i32),
    pub difficulty: i32,
    /// Ticks until the next rain level change.
    pub rain_time: i32,
    /// Rain intensity, 0.0 - 1.0.
    pub rain_level: f32,
    /// Ticks until the next lightning level change.
    pub lightning_time: i32,
    /// Lightning intensity, 0.0 - 1.0.
    pub lightning_level: f32,
    pub generator: String,
    /// Free-form generator settings, stored verbatim.
    pub generator_options: Value,
}

impl LevelData {
    /// Fresh-world defaults around the given identity.
    pub fn new(name: &str, seed: i64, generator: &str, generator_options: Value) -> Self {
        Self {
            name: name.to_string(),
            seed,
            time: 0,
            spawn: (128, 70, 128),
            difficulty: 2,
            rain_time: 0,
            rain_level: 0.0,
            lightning_time: 0,
            lightning_level: 0.0,
            generator: generator.to_string(),
            generator_options,
        }
    }
}

/// Parameters for generating a brand-new world, deserializable from the
/// server's world configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldCreationOptions {
    pub name: String,
    pub seed: i64,
    #[serde(default = "default_generator")]
    pub generator: String,
    #[serde(default)]
    pub generator_options: Value,
}

fn default_generator() -> String {
    "normal".into()
}

impl WorldCreationOptions {
    pub fn level_data(&self) -> LevelData {
        LevelData::new(
            &self.name,
            self.seed,
            &self.generator,
            self.generator_options.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_options_from_json() {
        let options: WorldCreationOptions =
            serde_json::from_str(r#"{"name": "world", "seed": 42}"#).unwrap();
        assert_eq!(options.generator, "normal");
        assert!(options.generator_options.is_null());

        let data = options.level_data();
        assert_eq!(data.name, "world");
        assert_eq!(data.seed, 42);
        assert_eq!(data.spawn, (128, 70, 128));
    }

    #[test]
    fn generator_options_pass_through() {
        let options: WorldCreationOptions = serde_json::from_str(
            r#"{"name": "flatland", "seed": 1, "generator": "flat", "generator_options": {"layers": [7, 3, 3, 2]}}"#,
        )
        .unwrap();
        let data = options.level_data();
        assert_eq!(data.generator, "flat");
        assert_eq!(data.generator_options["layers"][0], 7);
    }
}
