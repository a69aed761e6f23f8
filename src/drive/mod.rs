//! Turns the set of held arrow keys into a velocity command.

use crate::config::DriveConfig;
use crate::model::{KeyAction, KeyEvent, Twist};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

impl DirectionKey {
    pub const ALL: [DirectionKey; 4] = [Self::Up, Self::Down, Self::Left, Self::Right];

    pub fn from_key_name(name: &str) -> Option<Self> {
        match name {
            "ArrowUp" => Some(Self::Up),
            "ArrowDown" => Some(Self::Down),
            "ArrowLeft" => Some(Self::Left),
            "ArrowRight" => Some(Self::Right),
            _ => None,
        }
    }

    pub fn key_name(self) -> &'static str {
        match self {
            Self::Up => "ArrowUp",
            Self::Down => "ArrowDown",
            Self::Left => "ArrowLeft",
            Self::Right => "ArrowRight",
        }
    }
}

/// Keys currently held by the operator, in the order they were pressed.
///
/// Unknown key names are tracked too so they show up in feedback, but they
/// never contribute to motion.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    pressed: Vec<String>,
}

impl KeyState {
    /// Returns whether the held set changed.
    pub fn apply(&mut self, event: &KeyEvent) -> bool {
        match event.action {
            KeyAction::Down => {
                if self.pressed.iter().any(|k| k == &event.key) {
                    false
                } else {
                    self.pressed.push(event.key.clone());
                    true
                }
            }
            KeyAction::Up => {
                let before = self.pressed.len();
                self.pressed.retain(|k| k != &event.key);
                before != self.pressed.len()
            }
        }
    }

    pub fn pressed(&self) -> &[String] {
        &self.pressed
    }

    pub fn is_held(&self, key: DirectionKey) -> bool {
        self.pressed.iter().any(|k| k == key.key_name())
    }
}

/// Forward beats reverse and left beats right when both are held. Turning
/// while driving slows the linear speed and uses the diagonal yaw rate.
pub fn mix(profile: &DriveConfig, keys: &KeyState) -> Twist {
    let mut linear_x = if keys.is_held(DirectionKey::Up) {
        profile.linear_speed
    } else if keys.is_held(DirectionKey::Down) {
        -profile.linear_speed
    } else {
        0.0
    };

    let turn = if keys.is_held(DirectionKey::Left) {
        1.0
    } else if keys.is_held(DirectionKey::Right) {
        -1.0
    } else {
        0.0
    };

    let angular_z = if turn == 0.0 {
        0.0
    } else if linear_x != 0.0 {
        linear_x *= profile.diagonal_linear_factor;
        turn * profile.diagonal_angular_speed
    } else {
        turn * profile.angular_speed
    };

    Twist::new(linear_x, angular_z)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(keys: &[&str]) -> KeyState {
        let mut state = KeyState::default();
        for key in keys {
            state.apply(&KeyEvent::down(*key));
        }
        state
    }

    fn assert_twist(actual: Twist, linear: f64, angular: f64) {
        assert!((actual.linear.x - linear).abs() < 1e-9, "linear {actual:?}");
        assert!((actual.angular.z - angular).abs() < 1e-9, "angular {actual:?}");
    }

    #[test]
    fn straight_and_turn_in_place() {
        let profile = DriveConfig::default();
        assert_twist(mix(&profile, &held(&["ArrowUp"])), 0.26, 0.0);
        assert_twist(mix(&profile, &held(&["ArrowDown"])), -0.26, 0.0);
        assert_twist(mix(&profile, &held(&["ArrowLeft"])), 0.0, 1.82);
        assert_twist(mix(&profile, &held(&["ArrowRight"])), 0.0, -1.82);
    }

    #[test]
    fn diagonals_slow_down_and_use_diagonal_yaw() {
        let profile = DriveConfig::default();
        assert_twist(mix(&profile, &held(&["ArrowUp", "ArrowLeft"])), 0.182, 1.27);
        assert_twist(mix(&profile, &held(&["ArrowUp", "ArrowRight"])), 0.182, -1.27);
        assert_twist(mix(&profile, &held(&["ArrowDown", "ArrowLeft"])), -0.182, 1.27);
    }

    #[test]
    fn conflicting_keys_resolve_to_forward_and_left() {
        let profile = DriveConfig::default();
        assert_twist(mix(&profile, &held(&["ArrowDown", "ArrowUp"])), 0.26, 0.0);
        assert_twist(mix(&profile, &held(&["ArrowRight", "ArrowLeft"])), 0.0, 1.82);
    }

    #[test]
    fn releasing_every_key_stops() {
        let profile = DriveConfig::default();
        let mut keys = held(&["ArrowUp", "ArrowLeft"]);
        assert!(keys.apply(&KeyEvent::up("ArrowUp")));
        assert!(keys.apply(&KeyEvent::up("ArrowLeft")));
        assert!(mix(&profile, &keys).is_zero());
    }

    #[test]
    fn key_state_keeps_press_order_and_ignores_repeats() {
        let mut keys = held(&["ArrowUp", "ArrowLeft"]);
        assert!(!keys.apply(&KeyEvent::down("ArrowUp")));
        assert!(!keys.apply(&KeyEvent::up("ArrowDown")));
        assert!(keys.apply(&KeyEvent::down("Space")));
        assert_eq!(keys.pressed(), ["ArrowUp", "ArrowLeft", "Space"]);
        assert!(mix(&DriveConfig::default(), &held(&["Space"])).is_zero());
    }
}
