use crate::channel::Channel;
use crate::objective::{Objective, ObjectiveId};
use crate::types::Destination;

/// Persistence consumed by the engine. Entities are addressed by their
/// deterministic id and serialized independently; errors are opaque to this
/// crate.
///
/// The store also enforces channel ownership: an objective must never be
/// approved while another approved objective owns the same channel.
pub trait Store {
    fn get_objective_by_id(&self, id: &ObjectiveId) -> Result<Option<Objective>, anyhow::Error>;
    fn set_objective(&mut self, objective: &Objective) -> Result<(), anyhow::Error>;
    /// Removes a terminal objective and releases its channel ownership.
    fn destroy_objective(&mut self, id: &ObjectiveId) -> Result<(), anyhow::Error>;

    fn get_channel_by_id(&self, id: Destination) -> Result<Option<Channel>, anyhow::Error>;
    fn set_channel(&mut self, channel: &Channel) -> Result<(), anyhow::Error>;
    fn destroy_channel(&mut self, id: Destination) -> Result<(), anyhow::Error>;

    /// The confirmed-block watermark chain observation resumes from after a
    /// restart.
    fn get_last_block_num_seen(&self) -> Result<u64, anyhow::Error>;
    fn set_last_block_num_seen(&mut self, block_num: u64) -> Result<(), anyhow::Error>;

    fn release_channel_from_ownership(&mut self, id: Destination) -> Result<(), anyhow::Error>;
}
