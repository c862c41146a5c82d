//! Lockstep tick coordination.
//!
//! The coordinator tracks the tick every member has confirmed and derives
//! from it the limit members may simulate up to. The confirmed tick never
//! moves past the slowest member, so no client can outrun the others by
//! more than the configured buffer.

use shared::Tick;

#[derive(Debug)]
pub struct Lockstep {
    tick_rate: u32,
    tick_buffer: u32,
    random_seed: i64,
    confirmed_tick: Tick,
    action_seq: u64,
}

impl Lockstep {
    pub fn new(tick_rate: u32, tick_buffer: u32, random_seed: i64) -> Self {
        Lockstep {
            tick_rate,
            tick_buffer,
            random_seed,
            confirmed_tick: 0,
            action_seq: 0,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn tick_buffer(&self) -> u32 {
        self.tick_buffer
    }

    pub fn random_seed(&self) -> i64 {
        self.random_seed
    }

    pub fn confirmed_tick(&self) -> Tick {
        self.confirmed_tick
    }

    /// Highest tick members are allowed to simulate right now.
    pub fn tick_limit(&self) -> Tick {
        self.confirmed_tick + self.tick_buffer as Tick
    }

    /// Tick a newly relayed action is scheduled for: one past the limit
    /// every member has already been told about.
    pub fn action_tick(&self) -> Tick {
        self.tick_limit() + 1
    }

    /// Moves the confirmed tick up to the minimum of all members' confirmed
    /// ticks. Returns the new tick limit when the confirmed tick advanced.
    pub fn advance(&mut self, member_ticks: impl Iterator<Item = Tick>) -> Option<Tick> {
        let slowest = member_ticks.min()?;
        if slowest > self.confirmed_tick {
            self.confirmed_tick = slowest;
            Some(self.tick_limit())
        } else {
            None
        }
    }

    /// Hands out the sequence number for the next relayed action.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.action_seq;
        self.action_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_limit_is_buffer() {
        let lockstep = Lockstep::new(100, 3, 777_777);
        assert_eq!(lockstep.confirmed_tick(), 0);
        assert_eq!(lockstep.tick_limit(), 3);
        assert_eq!(lockstep.action_tick(), 4);
    }

    #[test]
    fn test_advance_is_gated_by_slowest_member() {
        let mut lockstep = Lockstep::new(100, 3, 0);

        // One member at 3, the other still at 1: limit follows the slowest.
        assert_eq!(lockstep.advance([3, 1].into_iter()), Some(4));
        assert_eq!(lockstep.confirmed_tick(), 1);

        // Nothing moved, no new limit.
        assert_eq!(lockstep.advance([3, 1].into_iter()), None);

        // Slowest catches up.
        assert_eq!(lockstep.advance([3, 3].into_iter()), Some(6));
        assert_eq!(lockstep.confirmed_tick(), 3);
    }

    #[test]
    fn test_advance_without_members() {
        let mut lockstep = Lockstep::new(100, 3, 0);
        assert_eq!(lockstep.advance(std::iter::empty()), None);
        assert_eq!(lockstep.confirmed_tick(), 0);
    }

    #[test]
    fn test_confirmed_never_exceeds_member_minimum() {
        let mut lockstep = Lockstep::new(100, 2, 0);
        let rounds: [[Tick; 3]; 6] = [
            [1, 1, 1],
            [4, 1, 2],
            [4, 3, 2],
            [4, 3, 9],
            [5, 5, 5],
            [6, 5, 9],
        ];

        for ticks in rounds {
            lockstep.advance(ticks.into_iter());
            let min = ticks.into_iter().min().unwrap();
            assert!(
                lockstep.confirmed_tick() <= min,
                "confirmed {} ran past member minimum {}",
                lockstep.confirmed_tick(),
                min
            );
        }
        assert_eq!(lockstep.confirmed_tick(), 5);
    }

    #[test]
    fn test_action_sequence_counts_up() {
        let mut lockstep = Lockstep::new(100, 3, 0);
        assert_eq!(lockstep.next_sequence(), 0);
        assert_eq!(lockstep.next_sequence(), 1);
        assert_eq!(lockstep.next_sequence(), 2);
    }

    #[test]
    fn test_action_tick_tracks_limit() {
        let mut lockstep = Lockstep::new(100, 5, 0);
        assert_eq!(lockstep.action_tick(), 6);
        lockstep.advance([2, 2].into_iter());
        assert_eq!(lockstep.tick_limit(), 7);
        assert_eq!(lockstep.action_tick(), 8);
    }
}
