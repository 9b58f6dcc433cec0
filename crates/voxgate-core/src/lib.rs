pub mod errors;
pub mod events;
pub mod ids;
pub mod sentence;
pub mod state;

pub use errors::ActionError;
pub use events::{DialogueSource, GatewayEvent};
pub use ids::{CharacterId, ChatId, ClientId, MessageId};
pub use sentence::{Sentence, SentenceBuffer};
pub use state::{AiState, CharacterInfo, GatewayState, StateSnapshot, StateStore};
