pub type DocumentId = uuid::Uuid;
pub type ConnectionId = u32;
pub type Revision = u64;
pub type Username = String;
