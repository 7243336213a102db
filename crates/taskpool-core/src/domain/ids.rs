//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! 永続化されるエンティティはすべて ULID で識別し、`Id<T>` で包みます。
//!
//! ## ULID の特性
//! - **時刻でソート可能**: 一覧の順序が作成順で安定する（連番カラム不要）
//! - **分散生成可能**: 複数のサービスインスタンスが調整なしで採番できる
//!
//! ## Phantom Type パターン
//! `T` は実行時には使わないマーカー型です。`ItemId` と `ActorId` は同じ表現を
//! 持ちますが別の型なので、コレクション ID でプールタスクを引くような取り違えは
//! コンパイルエラーになります。
//!
//! # 例
//! ```ignore
//! let item = ItemId::random();
//! let actor = ActorId::random();
//! // item と actor は異なる型なので、混同できない
//! assert!(item.to_string().starts_with("item-"));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"item-", "actor-" など）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// コンパイル時に型安全性を提供します。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the system clock. Production code goes through
    /// [`IdGenerator`](crate::ports::IdGenerator); this is for tests and demos.
    pub fn random() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Accepts both the bare ULID and the prefixed `Display` form.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

pub mod marker {
    use super::IdMarker;

    macro_rules! id_marker {
        ($name:ident, $prefix:literal) => {
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub enum $name {}

            impl IdMarker for $name {
                fn prefix() -> &'static str {
                    $prefix
                }
            }
        };
    }

    id_marker!(Item, "item-");
    id_marker!(Collection, "coll-");
    id_marker!(Actor, "actor-");
    id_marker!(Group, "group-");
    id_marker!(PoolTask, "pool-");
    id_marker!(ClaimedTask, "claim-");
}

/// A document under workflow review.
pub type ItemId = Id<marker::Item>;

/// The collection that owns a workflow item and its durable role mappings.
pub type CollectionId = Id<marker::Collection>;

/// A human who can act on tasks (e-person).
pub type ActorId = Id<marker::Actor>;

/// A group of actors, possibly nested inside other groups.
pub type GroupId = Id<marker::Group>;

pub type PoolTaskId = Id<marker::PoolTask>;

pub type ClaimedTaskId = Id<marker::ClaimedTask>;
