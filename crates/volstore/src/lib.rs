//! Hierarchical volumetric attribute store with a replicable edit log.
//!
//! A sparse octree holds typed attribute overrides; spanners (large shared
//! objects such as terrain tiles) are voxelized into ordinary attributes.
//! All mutation goes through [`Edit`]s, which are deterministic and can be
//! shipped to replicas as [`EditMessage`]s.

pub mod attribute;
pub mod edit;
pub mod guide;
pub mod log;
pub mod message;
pub mod node;
pub mod objects;
pub mod region;
pub mod spanner;
pub mod tree;

pub use attribute::{
    AttributeDescriptor, AttributeId, AttributeKind, AttributeRegistry, AttributeValue, BlendFn, LodMultipliers,
    MaterialId, RegistryError, Rgba, default_blend,
};
pub use edit::{
    BoxSetEdit, ClearSpannersEdit, Edit, EditError, GlobalSetEdit, InsertSpannerEdit, PaintHeightfieldHeightEdit,
    RemoveSpannerEdit, SetDataEdit, SetSpannerEdit, SetSpannerMaterialEdit, material_edit_color,
};
pub use guide::{MAX_DEPTH, VisitInfo, VisitOutcome, Visitor};
pub use log::{EditLog, SnapshotReader};
pub use message::{EDIT_PROTOCOL_VERSION, EditMessage, MessageError};
pub use node::Node;
pub use objects::ObjectRefTable;
pub use region::Region;
pub use spanner::{Heightfield, Spanner, SpannerId, SpannerSet, SpannerShape};
pub use tree::{DEFAULT_MAX_EXPANSIONS, VolumeData, VolumeTree};
