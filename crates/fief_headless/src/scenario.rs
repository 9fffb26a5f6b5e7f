//! Scenario descriptions: everything needed to set up a reproducible game.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fief_core::error::{GameError, Result};
use fief_core::game::Game;
use fief_core::map::MapGeneratorParams;

/// One player slot in a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Portrait index.
    pub face: u32,
    /// Color index.
    pub color: u32,
    /// Initial supplies setting.
    pub supplies: u32,
    /// Reproduction rate setting.
    pub reproduction: u32,
    /// Intelligence setting.
    pub intelligence: u32,
    /// Whether an AI driver controls the slot.
    pub is_ai: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            face: 12,
            color: 64,
            supplies: 35,
            reproduction: 30,
            intelligence: 40,
            is_ai: true,
        }
    }
}

/// A reproducible game setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Map size class (3 is 64x128).
    pub map_size: u32,
    /// Seed for the map generator and game random.
    pub seed: u64,
    /// Map generator parameter bundle.
    pub generator: MapGeneratorParams,
    /// Player slots, in order.
    pub players: Vec<PlayerConfig>,
    /// Initial game speed.
    pub game_speed: u32,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            map_size: 3,
            seed: 8_667_715_887_436_237,
            generator: MapGeneratorParams::default(),
            players: vec![PlayerConfig::default(), PlayerConfig::default()],
            game_speed: 2,
        }
    }
}

impl Scenario {
    /// Load a scenario from a RON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).map_err(|e| GameError::LoadFailed(e.to_string()))?;
        ron::from_str(&text).map_err(|e| GameError::LoadFailed(e.to_string()))
    }

    /// Write the scenario to a RON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| GameError::SaveFailed(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| GameError::SaveFailed(e.to_string()))
    }

    /// Instantiate the game: generated map, players added, speed set.
    pub fn build_game(&self) -> Result<Game> {
        let mut game = Game::new(self.map_size, self.seed, &self.generator);
        for config in &self.players {
            let slot = game.add_player(
                config.face,
                config.color,
                config.supplies,
                config.reproduction,
                config.intelligence,
            )?;
            if let Some(player) = game.player_mut(slot) {
                player.is_ai = config.is_ai;
            }
        }
        game.set_game_speed(self.game_speed);
        Ok(game)
    }

    /// Slots driven by AI.
    #[must_use]
    pub fn ai_slots(&self) -> Vec<u8> {
        self.players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_ai)
            .map(|(i, _)| i as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scenario_builds() {
        let scenario = Scenario::default();
        let game = scenario.build_game().unwrap();
        assert_eq!(game.player_indices().len(), 2);
        assert_eq!(game.game_speed(), 2);
        assert_eq!(scenario.ai_slots(), vec![0, 1]);
    }

    #[test]
    fn test_scenario_ron_round_trip() {
        let scenario = Scenario::default();
        let text = ron::ser::to_string_pretty(&scenario, ron::ser::PrettyConfig::default())
            .unwrap();
        let parsed: Scenario = ron::from_str(&text).unwrap();
        assert_eq!(scenario, parsed);
    }

    #[test]
    fn test_same_scenario_same_game() {
        let scenario = Scenario::default();
        let a = scenario.build_game().unwrap();
        let b = scenario.build_game().unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }
}
