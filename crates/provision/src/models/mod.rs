//! Persistent records.

mod binding;
mod command;
mod image;
mod node;
mod policy;

pub use binding::{ActiveModel, RebindRequest};
pub use command::{Command, CommandName};
pub use image::{version_weight, Image, ImageKind, VersionWeight};
pub use node::{HardwareIdentity, Node, NodeStatus};
pub use policy::{parse_tag_expression, MatchMode, Policy};

use crate::store::{Document, Kind};

macro_rules! document {
    ($ty:ty, $kind:expr) => {
        impl Document for $ty {
            const KIND: Kind = $kind;

            fn uuid(&self) -> &str {
                &self.uuid
            }
        }
    };
}

document!(Node, Kind::Node);
document!(Policy, Kind::Policy);
document!(ActiveModel, Kind::ActiveModel);
document!(RebindRequest, Kind::RebindRequest);
document!(Image, Kind::Image);
