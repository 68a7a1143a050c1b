//! Partition command dispatch.
//!
//! A partition is the data structure a chain link replicates. It publishes a
//! command table that tells the link which commands are accessors (answered
//! by the tail alone) and which are mutators (executed by every link in
//! chain order). Unknown commands and wrong arity come back as status tags,
//! never as errors.
//!
//! ```text
//!   args ──► CommandTable ──► accessor ──► tail only
//!                    │
//!                    └──────► mutator  ──► head → mid → tail
//! ```

use crate::error::{Result, StorageError};
use crate::storage::arena::Arena;
use crate::storage::hashtable::HashStore;
use crate::types::{Response, Status};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

/// Whether a command reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Accessor,
    Mutator,
}

/// One entry of a partition's command table.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub kind: CommandKind,
}

impl Command {
    pub const fn accessor(name: &'static str) -> Self {
        Self {
            name,
            kind: CommandKind::Accessor,
        }
    }

    pub const fn mutator(name: &'static str) -> Self {
        Self {
            name,
            kind: CommandKind::Mutator,
        }
    }
}

/// Static list of the commands a partition type understands.
#[derive(Debug)]
pub struct CommandTable {
    commands: &'static [Command],
}

impl CommandTable {
    pub const fn new(commands: &'static [Command]) -> Self {
        Self { commands }
    }

    pub fn kind(&self, name: &str) -> Option<CommandKind> {
        self.commands.iter().find(|c| c.name == name).map(|c| c.kind)
    }

    /// Position of the command in the table, used as its op id.
    pub fn id(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.name == name)
    }

    pub fn is_accessor(&self, name: &str) -> bool {
        self.kind(name) == Some(CommandKind::Accessor)
    }

    pub fn is_mutator(&self, name: &str) -> bool {
        self.kind(name) == Some(CommandKind::Mutator)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.commands.iter().map(|c| c.name)
    }
}

/// Permission to run a command against a partition's table gate.
///
/// Links acquire it before taking their ordering mutex, so a command waiting
/// on a locked table never blocks the commands that will unlock it.
#[derive(Debug)]
pub enum Admission {
    /// The command does not touch the gate.
    Free,
    /// Plain single-key traffic, excluded while the table is locked.
    Shared(OwnedRwLockReadGuard<()>),
    /// The table lock itself.
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Follow-up work a command asks of the link that ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    /// Usage crossed the split threshold.
    Overloaded,
    /// Usage fell below the merge threshold.
    Underloaded,
    /// An import finished into a wider range; the named source partition
    /// should be dropped.
    ImportFinished { source: String },
}

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub response: Response,
    pub event: Option<PartitionEvent>,
}

impl CommandOutput {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            event: None,
        }
    }

    pub fn with_event(response: Response, event: Option<PartitionEvent>) -> Self {
        Self { response, event }
    }
}

impl From<Response> for CommandOutput {
    fn from(response: Response) -> Self {
        Self::new(response)
    }
}

/// Capability interface every partition type implements.
#[async_trait]
pub trait Partition: Send + Sync {
    /// Partition name, e.g. the slot range of a hash table shard.
    fn name(&self) -> String;

    /// Partition metadata, e.g. `regular`.
    fn metadata(&self) -> String;

    fn commands(&self) -> &'static CommandTable;

    fn command_kind(&self, name: &str) -> Option<CommandKind> {
        self.commands().kind(name)
    }

    /// Acquire whatever the command needs before it may run.
    async fn admit(&self, _command: &str) -> Admission {
        Admission::Free
    }

    /// Execute `args[0]` with the remaining arguments.
    async fn run_command(&self, args: &[String], admission: Admission) -> CommandOutput;

    /// Bytes currently charged to the block.
    fn storage_size(&self) -> usize;

    /// Bytes the block may hold.
    fn storage_capacity(&self) -> usize;

    /// Replace the contents with the snapshot at `path`.
    async fn load(&self, path: &str) -> Result<()>;

    /// Write a snapshot to `path` if anything changed; returns whether it wrote.
    async fn sync(&self, path: &str) -> Result<bool>;

    /// Like [`Partition::sync`], then clear the contents.
    async fn dump(&self, path: &str) -> Result<bool>;
}

/// Partition types a block can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    HashTable,
    Default,
}

impl FromStr for PartitionKind {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hashtable" => Ok(PartitionKind::HashTable),
            "default" => Ok(PartitionKind::Default),
            other => Err(StorageError::UnknownPartitionType(other.to_string())),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::HashTable => f.write_str("hashtable"),
            PartitionKind::Default => f.write_str("default"),
        }
    }
}

/// The partition hosted by a block.
pub enum AnyPartition {
    HashTable(Arc<HashStore>),
    Default(DefaultPartition),
}

impl AnyPartition {
    pub fn kind(&self) -> PartitionKind {
        match self {
            AnyPartition::HashTable(_) => PartitionKind::HashTable,
            AnyPartition::Default(_) => PartitionKind::Default,
        }
    }

    pub fn as_hash_table(&self) -> Option<&Arc<HashStore>> {
        match self {
            AnyPartition::HashTable(store) => Some(store),
            AnyPartition::Default(_) => None,
        }
    }

    fn inner(&self) -> &dyn Partition {
        match self {
            AnyPartition::HashTable(store) => &**store,
            AnyPartition::Default(p) => p,
        }
    }
}

impl fmt::Debug for AnyPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyPartition")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("metadata", &self.metadata())
            .finish()
    }
}

#[async_trait]
impl Partition for AnyPartition {
    fn name(&self) -> String {
        self.inner().name()
    }

    fn metadata(&self) -> String {
        self.inner().metadata()
    }

    fn commands(&self) -> &'static CommandTable {
        self.inner().commands()
    }

    async fn admit(&self, command: &str) -> Admission {
        self.inner().admit(command).await
    }

    async fn run_command(&self, args: &[String], admission: Admission) -> CommandOutput {
        self.inner().run_command(args, admission).await
    }

    fn storage_size(&self) -> usize {
        self.inner().storage_size()
    }

    fn storage_capacity(&self) -> usize {
        self.inner().storage_capacity()
    }

    async fn load(&self, path: &str) -> Result<()> {
        self.inner().load(path).await
    }

    async fn sync(&self, path: &str) -> Result<bool> {
        self.inner().sync(path).await
    }

    async fn dump(&self, path: &str) -> Result<bool> {
        self.inner().dump(path).await
    }
}

static NO_COMMANDS: CommandTable = CommandTable::new(&[]);

/// Placeholder partition with no commands.
#[derive(Debug)]
pub struct DefaultPartition {
    name: String,
    metadata: String,
    arena: Arc<Arena>,
}

impl DefaultPartition {
    pub fn new(arena: Arc<Arena>, name: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: metadata.into(),
            arena,
        }
    }
}

#[async_trait]
impl Partition for DefaultPartition {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn metadata(&self) -> String {
        self.metadata.clone()
    }

    fn commands(&self) -> &'static CommandTable {
        &NO_COMMANDS
    }

    async fn run_command(&self, _args: &[String], _admission: Admission) -> CommandOutput {
        Status::UnknownCommand.reply().into()
    }

    fn storage_size(&self) -> usize {
        self.arena.used()
    }

    fn storage_capacity(&self) -> usize {
        self.arena.capacity()
    }

    async fn load(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn sync(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }

    async fn dump(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static TABLE: CommandTable =
        CommandTable::new(&[Command::accessor("get"), Command::mutator("put")]);

    #[test]
    fn test_command_table_lookup() {
        assert_eq!(TABLE.kind("get"), Some(CommandKind::Accessor));
        assert!(TABLE.is_mutator("put"));
        assert!(!TABLE.is_accessor("put"));
        assert_eq!(TABLE.kind("nope"), None);
        assert_eq!(TABLE.id("put"), Some(1));
        assert_eq!(TABLE.names().collect::<Vec<_>>(), vec!["get", "put"]);
    }

    #[test]
    fn test_partition_kind_parse() {
        assert_eq!("hashtable".parse::<PartitionKind>().unwrap(), PartitionKind::HashTable);
        assert_eq!("default".parse::<PartitionKind>().unwrap(), PartitionKind::Default);
        assert!("fifo_queue".parse::<PartitionKind>().is_err());
    }

    #[tokio::test]
    async fn test_default_partition_rejects_everything() {
        let partition = AnyPartition::Default(DefaultPartition::new(Arena::new(16), "default", "regular"));
        assert_eq!(partition.kind(), PartitionKind::Default);
        assert!(partition.command_kind("get").is_none());

        let out = partition
            .run_command(&["get".to_string(), "k".to_string()], Admission::Free)
            .await;
        assert_eq!(out.response, vec!["!unknown_command".to_string()]);
        assert_eq!(partition.storage_capacity(), 16);
        assert!(!partition.sync("/nonexistent").await.unwrap());
    }
}
