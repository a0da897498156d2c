// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Drawing-resource boundary between the edit engine and whatever renders the map.

use crate::LngLat;
use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Marker {
        at: LngLat,
        label: String,
    },
    Polyline {
        path: Vec<LngLat>,
        color: String,
    },
    /// Distance annotation shown next to a segment.
    Label {
        at: LngLat,
        text: String,
    },
    DragHandle {
        at: LngLat,
        index: usize,
    },
    /// Lightweight line shown while a handle is being dragged.
    Preview {
        path: Vec<LngLat>,
    },
}

pub trait MapCanvas {
    fn draw(&mut self, shape: Shape) -> DrawHandle;
    fn update(&mut self, handle: DrawHandle, shape: Shape);
    fn remove(&mut self, handle: DrawHandle);
}

/// Keeps every live shape in memory. Used when there is no real map attached.
#[derive(Debug, Default)]
pub struct HeadlessCanvas {
    next_id: u64,
    live: AHashMap<DrawHandle, Shape>,
}

impl HeadlessCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, handle: DrawHandle) -> Option<&Shape> {
        self.live.get(&handle)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.live.values()
    }
}

impl MapCanvas for HeadlessCanvas {
    fn draw(&mut self, shape: Shape) -> DrawHandle {
        self.next_id += 1;
        let handle = DrawHandle(self.next_id);
        self.live.insert(handle, shape);
        handle
    }

    fn update(&mut self, handle: DrawHandle, shape: Shape) {
        if let Some(existing) = self.live.get_mut(&handle) {
            *existing = shape;
        }
    }

    fn remove(&mut self, handle: DrawHandle) {
        self.live.remove(&handle);
    }
}
