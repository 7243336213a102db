//! Names - ワークフロー定義由来の名前
//!
//! workflow / step / action / role はストアではなくワークフローテンプレートから
//! 来る値なので、ULID ではなく文字列の newtype で表します。
//!
//! # 例
//! ```ignore
//! let step = StepId::new("review");
//! let action: ActionId = "approve".into();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! config_name {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

config_name!(
    /// Workflow template identifier (e.g. `default`, `wf1`).
    WorkflowId
);

config_name!(
    /// Named stage of a workflow template (e.g. `review`, `edit`).
    StepId
);

config_name!(
    /// Task to perform inside a step (e.g. `approve`, `claim`).
    ActionId
);

config_name!(
    /// Role identifier resolved to an actor or group (e.g. `reviewer`).
    RoleId
);
