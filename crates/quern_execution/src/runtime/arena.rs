//! Hierarchical scoped arenas.
//!
//! Arenas track the lifecycle of per-group aggregate state: expanded objects
//! live in arena slots, shutdown callbacks fire when an arena is reset at a
//! group boundary, and resetting a parent cascades to its children. Handles
//! are indices plus a generation, never pointers.

use std::any::Any;
use std::fmt;

use quern_error::{QuernError, Result};

use crate::arrays::datum::{Datum, ExpandedRef};

/// Identifies one arena within a [`MemoryContexts`] tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(pub(crate) u32);

/// A value that can be mutated in place across rows of the same group while
/// registered with an arena, then flattened to a plain datum at finalize.
pub trait ExpandedObject: fmt::Debug + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Produce the plain datum image of this object.
    fn flatten(&self) -> Datum;
}

type ShutdownCallback = Box<dyn FnOnce() + Send>;

struct ArenaNode {
    alive: bool,
    parent: Option<ArenaId>,
    children: Vec<ArenaId>,
    name: &'static str,
    generation: u64,
    expanded: Vec<Option<Box<dyn ExpandedObject>>>,
    callbacks: Vec<ShutdownCallback>,
}

impl fmt::Debug for ArenaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaNode")
            .field("alive", &self.alive)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("num_expanded", &self.expanded.len())
            .field("num_callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Tree of arenas owned by one operator instance.
#[derive(Debug)]
pub struct MemoryContexts {
    nodes: Vec<ArenaNode>,
}

impl MemoryContexts {
    /// Create a context tree with a root arena.
    pub fn new() -> (Self, ArenaId) {
        let root = ArenaNode {
            alive: true,
            parent: None,
            children: Vec::new(),
            name: "root",
            generation: 0,
            expanded: Vec::new(),
            callbacks: Vec::new(),
        };
        (MemoryContexts { nodes: vec![root] }, ArenaId(0))
    }

    pub fn create_child(&mut self, parent: ArenaId, name: &'static str) -> Result<ArenaId> {
        self.node(parent)?;
        let id = ArenaId(self.nodes.len() as u32);
        self.nodes.push(ArenaNode {
            alive: true,
            parent: Some(parent),
            children: Vec::new(),
            name,
            generation: 0,
            expanded: Vec::new(),
            callbacks: Vec::new(),
        });
        self.nodes[parent.0 as usize].children.push(id);
        Ok(id)
    }

    /// Reset an arena: run its shutdown callbacks, drop its expanded objects,
    /// and cascade into every child.
    ///
    /// Callbacks run only here; error unwinding never reaches them.
    pub fn reset(&mut self, id: ArenaId) -> Result<()> {
        self.node(id)?;

        let node = &mut self.nodes[id.0 as usize];
        let callbacks = std::mem::take(&mut node.callbacks);
        node.expanded.clear();
        node.generation += 1;
        let children = node.children.clone();

        for cb in callbacks {
            cb();
        }
        for child in children {
            self.reset(child)?;
        }
        Ok(())
    }

    /// Reset and detach an arena subtree.
    pub fn delete(&mut self, id: ArenaId) -> Result<()> {
        self.reset(id)?;
        let parent = self.nodes[id.0 as usize].parent;
        if let Some(parent) = parent {
            self.nodes[parent.0 as usize]
                .children
                .retain(|child| *child != id);
        }
        let children = self.nodes[id.0 as usize].children.clone();
        for child in children {
            self.nodes[child.0 as usize].parent = None;
            self.delete(child)?;
        }
        self.nodes[id.0 as usize].alive = false;
        Ok(())
    }

    /// Register a shutdown callback fired on the next reset of this arena.
    pub fn register_callback<F>(&mut self, id: ArenaId, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.node_mut(id)?.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Move an expanded object into the arena, returning a read-write handle.
    pub fn register_expanded(
        &mut self,
        id: ArenaId,
        obj: Box<dyn ExpandedObject>,
    ) -> Result<ExpandedRef> {
        let node = self.node_mut(id)?;
        let slot = node.expanded.len();
        let generation = node.generation;
        node.expanded.push(Some(obj));
        Ok(ExpandedRef {
            arena: id,
            slot,
            generation,
            read_only: false,
        })
    }

    pub fn expanded(&self, eref: ExpandedRef) -> Result<&dyn ExpandedObject> {
        let node = self.node(eref.arena)?;
        Self::check_generation(node, eref)?;
        node.expanded
            .get(eref.slot)
            .and_then(|slot| slot.as_deref())
            .ok_or_else(|| QuernError::new("Stale expanded object handle"))
    }

    pub fn expanded_mut(&mut self, eref: ExpandedRef) -> Result<&mut (dyn ExpandedObject + 'static)> {
        if eref.read_only {
            return Err(QuernError::new(
                "Attempted to mutate a read-only expanded object",
            ));
        }
        let node = self.node_mut(eref.arena)?;
        Self::check_generation(node, eref)?;
        node.expanded
            .get_mut(eref.slot)
            .and_then(|slot| slot.as_deref_mut())
            .ok_or_else(move || QuernError::new("Stale expanded object handle"))
    }

    /// Remove an expanded object from its arena, dropping it.
    pub fn delete_expanded(&mut self, eref: ExpandedRef) -> Result<()> {
        let node = self.node_mut(eref.arena)?;
        Self::check_generation(node, eref)?;
        let slot = node
            .expanded
            .get_mut(eref.slot)
            .ok_or_else(|| QuernError::new("Stale expanded object handle"))?;
        *slot = None;
        Ok(())
    }

    pub fn generation(&self, id: ArenaId) -> Result<u64> {
        Ok(self.node(id)?.generation)
    }

    fn check_generation(node: &ArenaNode, eref: ExpandedRef) -> Result<()> {
        if node.generation != eref.generation {
            return Err(QuernError::new(format!(
                "Expanded object handle outlived arena '{}' (generation {} vs {})",
                node.name, eref.generation, node.generation
            )));
        }
        Ok(())
    }

    fn node(&self, id: ArenaId) -> Result<&ArenaNode> {
        match self.nodes.get(id.0 as usize) {
            Some(node) if node.alive => Ok(node),
            _ => Err(QuernError::new(format!("Arena no longer exists: {id:?}"))),
        }
    }

    fn node_mut(&mut self, id: ArenaId) -> Result<&mut ArenaNode> {
        match self.nodes.get_mut(id.0 as usize) {
            Some(node) if node.alive => Ok(node),
            _ => Err(QuernError::new(format!("Arena no longer exists: {id:?}"))),
        }
    }
}
