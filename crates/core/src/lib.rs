pub mod codec;
pub mod command;
pub mod engine;
pub mod error;
pub mod mediator;
pub mod model;
pub mod mutation;
pub mod render;

pub use codec::{ChangeEvent, ChangeKind};
pub use command::SilentCommandStack;
pub use engine::Engine;
pub use error::{Error, Result};
pub use mediator::EventMediator;
pub use model::element::{Element, ElementData, ElementId, Point};
pub use model::store::ModelStore;
pub use mutation::{MutationOp, OpOutcome, SilentMutationLayer};
pub use render::{LowLevelEditor, NullEditor, RenderGate};
