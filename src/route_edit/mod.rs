// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

// Interactive segment editing: candidates, drag-to-reroute, undo, delete


use crate::LngLat;
use crate::coordinates::{SENTINEL, is_sentinel, position_at_fraction, prefix_until, suffix_from};
use crate::drawing::{DrawHandle, MapCanvas, Shape};
use crate::network_graph::{GraphError, NetworkGraph, SegmentKey, label_position_for};
use crate::point_index::PointResolver;
use crate::routing_service::{RouteCandidate, RoutingError, RoutingService};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Polyline colours for candidate routes, by rank.
pub const CANDIDATE_COLORS: [&str; 3] = ["#1E90FF", "#FF8C00", "#8A2BE2"];

/// Where drag handles sit along a selected path, as fractions of its length.
pub const HANDLE_FRACTIONS: [f64; 5] = [0.0, 0.25, 0.5, 0.75, 1.0];

#[derive(Error, Debug)]
pub enum EditError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("the routing service found no route")]
    NoRouteFound,
    #[error("no segment is selected")]
    NoSelection,
    #[error("a drag is in progress on {0}")]
    EditInProgress(SegmentKey),
    #[error("no drag is in progress")]
    NotEditing,
    #[error("handle {0} cannot be dragged")]
    InvalidHandle(usize),
    #[error("no candidates have been requested")]
    NoCandidates,
    #[error("no candidate with rank {0}")]
    UnknownCandidate(usize),
    #[error("unknown point '{0}'")]
    UnknownPoint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Unselected,
    Selected,
    Editing,
    Deleted,
}

/// Everything the engine can be asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum EditCommand {
    RequestCandidates { origin: String, destination: String },
    SelectCandidate { rank: usize },
    SelectSegment(SegmentKey),
    Deselect,
    BeginDrag { handle: usize },
    DragTo { position: LngLat },
    EndDrag { position: LngLat },
    Undo(SegmentKey),
    Delete(SegmentKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    Candidates(usize),
    Selected(SegmentKey),
    Deselected,
    Dragging,
    Committed(SegmentKey),
    Undone(bool),
    Deleted(SegmentKey),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EditPhase {
    Selected,
    Editing {
        handle: usize,
        preview: DrawHandle,
        position: LngLat,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSelection {
    pub route_key: SegmentKey,
    pub phase: EditPhase,
    handles: [DrawHandle; 5],
}

#[derive(Debug, Clone, Copy)]
struct SegmentDrawing {
    polyline: DrawHandle,
    label: DrawHandle,
}

#[derive(Debug, Clone)]
struct CandidateVariant {
    route: RouteCandidate,
    drawing: SegmentDrawing,
}

#[derive(Debug, Clone)]
struct CandidateSet {
    origin: String,
    destination: String,
    route_key: SegmentKey,
    variants: Vec<CandidateVariant>,
}

pub struct RouteEditEngine<C: MapCanvas> {
    graph: NetworkGraph,
    canvas: C,
    markers: Vec<DrawHandle>,
    drawn: BTreeMap<SegmentKey, SegmentDrawing>,
    candidates: Option<CandidateSet>,
    selection: Option<RouteSelection>,
    deleted: BTreeSet<SegmentKey>,
}

fn distance_text(km: f64) -> String {
    format!("{:.2} km", km)
}

impl<C: MapCanvas> RouteEditEngine<C> {
    pub fn new(canvas: C) -> Self {
        Self {
            graph: NetworkGraph::default(),
            canvas,
            markers: Vec::new(),
            drawn: BTreeMap::new(),
            candidates: None,
            selection: None,
            deleted: BTreeSet::new(),
        }
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    pub fn canvas(&self) -> &C {
        &self.canvas
    }

    pub fn selection(&self) -> Option<&RouteSelection> {
        self.selection.as_ref()
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.as_ref().map_or(0, |c| c.variants.len())
    }

    pub fn state(&self, key: &SegmentKey) -> Option<SegmentState> {
        if self.deleted.contains(key) {
            return Some(SegmentState::Deleted);
        }
        match &self.selection {
            Some(sel) if &sel.route_key == key => Some(match sel.phase {
                EditPhase::Selected => SegmentState::Selected,
                EditPhase::Editing { .. } => SegmentState::Editing,
            }),
            _ => self
                .graph
                .segment(key)
                .map(|_| SegmentState::Unselected),
        }
    }

    /// Replace whatever is on the map with `graph` and draw it.
    pub fn load_network(&mut self, graph: NetworkGraph) {
        self.clear_map_data();
        self.graph = graph;

        for point in self.graph.points() {
            if is_sentinel(&point.coordinates) {
                warn!("not drawing '{}', it has no valid coordinates", point.name);
                continue;
            }
            let handle = self.canvas.draw(Shape::Marker {
                at: point.coordinates,
                label: point.name.clone(),
            });
            self.markers.push(handle);
        }

        let segments: Vec<_> = self
            .graph
            .segments()
            .iter()
            .map(|(k, d)| (k.clone(), d.connection.clone(), d.label_position))
            .collect();
        for (key, connection, label_at) in segments {
            let drawing = SegmentDrawing {
                polyline: self.canvas.draw(Shape::Polyline {
                    path: connection.path,
                    color: connection.color,
                }),
                label: self.canvas.draw(Shape::Label {
                    at: label_at,
                    text: distance_text(connection.length_km),
                }),
            };
            self.drawn.insert(key, drawing);
        }

        info!(
            "loaded network: {} markers, {} segments",
            self.markers.len(),
            self.drawn.len()
        );
    }

    /// Release every drawing resource and reset the graph.
    pub fn clear_map_data(&mut self) {
        self.discard_candidates();
        self.detach_selection();

        for handle in self.markers.drain(..) {
            self.canvas.remove(handle);
        }
        for (_, drawing) in std::mem::take(&mut self.drawn) {
            self.canvas.remove(drawing.polyline);
            self.canvas.remove(drawing.label);
        }

        self.deleted.clear();
        self.graph.reset();
    }

    pub async fn execute<R: RoutingService>(
        &mut self,
        routing: &R,
        command: EditCommand,
    ) -> Result<EditOutcome, EditError> {
        match command {
            EditCommand::RequestCandidates {
                origin,
                destination,
            } => self
                .request_candidates(routing, &origin, &destination)
                .await
                .map(EditOutcome::Candidates),
            EditCommand::SelectCandidate { rank } => {
                self.select_candidate(rank).map(EditOutcome::Selected)
            }
            EditCommand::SelectSegment(key) => {
                self.select_segment(&key)?;
                Ok(EditOutcome::Selected(key))
            }
            EditCommand::Deselect => {
                self.deselect()?;
                Ok(EditOutcome::Deselected)
            }
            EditCommand::BeginDrag { handle } => {
                self.begin_drag(handle)?;
                Ok(EditOutcome::Dragging)
            }
            EditCommand::DragTo { position } => {
                self.drag_to(position)?;
                Ok(EditOutcome::Dragging)
            }
            EditCommand::EndDrag { position } => self
                .end_drag(routing, position)
                .await
                .map(EditOutcome::Committed),
            EditCommand::Undo(key) => self.undo(&key).map(EditOutcome::Undone),
            EditCommand::Delete(key) => {
                self.delete_segment(&key)?;
                Ok(EditOutcome::Deleted(key))
            }
        }
    }

    fn locate_point(&self, name: &str) -> Result<LngLat, EditError> {
        let id = self
            .graph
            .point_by_name(name)
            .or_else(|| self.graph.index().resolve(Some(name), None).point)
            .ok_or_else(|| EditError::UnknownPoint(name.to_string()))?;
        let point = self
            .graph
            .point(id)
            .ok_or_else(|| EditError::UnknownPoint(name.to_string()))?;
        if is_sentinel(&point.coordinates) {
            return Err(EditError::UnknownPoint(name.to_string()));
        }
        Ok(point.coordinates)
    }

    /// Ask the routing service for alternatives between two points and draw
    /// them. Earlier candidates are discarded.
    pub async fn request_candidates<R: RoutingService>(
        &mut self,
        routing: &R,
        origin: &str,
        destination: &str,
    ) -> Result<usize, EditError> {
        let from = self.locate_point(origin)?;
        let to = self.locate_point(destination)?;

        self.discard_candidates();

        let routes = routing.show_route(from, to).await?;
        if routes.is_empty() {
            return Err(EditError::NoRouteFound);
        }

        let variants: Vec<CandidateVariant> = routes
            .into_iter()
            .zip(CANDIDATE_COLORS)
            .map(|(route, color)| {
                let drawing = SegmentDrawing {
                    polyline: self.canvas.draw(Shape::Polyline {
                        path: route.path.clone(),
                        color: color.to_string(),
                    }),
                    label: self.canvas.draw(Shape::Label {
                        at: label_position_for(&route.path),
                        text: distance_text(route.distance_km),
                    }),
                };
                CandidateVariant { route, drawing }
            })
            .collect();

        let count = variants.len();
        debug!("{} candidates between {} and {}", count, origin, destination);

        self.candidates = Some(CandidateSet {
            origin: origin.to_string(),
            destination: destination.to_string(),
            route_key: SegmentKey::new(destination, origin),
            variants,
        });
        Ok(count)
    }

    /// Keep one candidate, drop the others, write it into the graph and select it.
    pub fn select_candidate(&mut self, rank: usize) -> Result<SegmentKey, EditError> {
        self.ensure_not_editing()?;
        let set = self.candidates.take().ok_or(EditError::NoCandidates)?;
        if rank >= set.variants.len() {
            self.candidates = Some(set);
            return Err(EditError::UnknownCandidate(rank));
        }
        debug!("promoting candidate {} of {}", rank, set.route_key);

        let mut chosen = None;
        for (i, variant) in set.variants.into_iter().enumerate() {
            if i == rank {
                chosen = Some(variant);
            } else {
                self.canvas.remove(variant.drawing.polyline);
                self.canvas.remove(variant.drawing.label);
            }
        }
        let chosen = chosen.ok_or(EditError::UnknownCandidate(rank))?;

        let key = match self.graph.select_alternate_route(
            chosen.route.path.clone(),
            &set.origin,
            &set.destination,
            chosen.route.distance_km,
        ) {
            Ok(key) => key,
            Err(e) => {
                self.canvas.remove(chosen.drawing.polyline);
                self.canvas.remove(chosen.drawing.label);
                return Err(e.into());
            }
        };

        if let Some(old) = self.drawn.remove(&key) {
            self.canvas.remove(old.polyline);
            self.canvas.remove(old.label);
        }
        self.drawn.insert(key.clone(), chosen.drawing);
        self.deleted.remove(&key);
        self.redraw_segment(&key);

        self.select_segment(&key)?;
        Ok(key)
    }

    /// Attach drag handles to a segment. Any other selection is released.
    pub fn select_segment(&mut self, key: &SegmentKey) -> Result<(), EditError> {
        self.ensure_not_editing()?;
        let path = self
            .graph
            .segment(key)
            .map(|d| d.connection.path.clone())
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;

        self.detach_selection();

        let handles: [DrawHandle; 5] = std::array::from_fn(|index| {
            self.canvas.draw(Shape::DragHandle {
                at: position_at_fraction(&path, HANDLE_FRACTIONS[index]).unwrap_or(SENTINEL),
                index,
            })
        });

        self.selection = Some(RouteSelection {
            route_key: key.clone(),
            phase: EditPhase::Selected,
            handles,
        });
        Ok(())
    }

    pub fn deselect(&mut self) -> Result<(), EditError> {
        self.ensure_not_editing()?;
        self.detach_selection();
        Ok(())
    }

    /// Start dragging one of the interior handles of the selected segment.
    pub fn begin_drag(&mut self, handle: usize) -> Result<(), EditError> {
        if handle == 0 || handle >= HANDLE_FRACTIONS.len() - 1 {
            return Err(EditError::InvalidHandle(handle));
        }
        let sel = self.selection.as_ref().ok_or(EditError::NoSelection)?;
        if let EditPhase::Editing { .. } = sel.phase {
            return Err(EditError::EditInProgress(sel.route_key.clone()));
        }
        let key = sel.route_key.clone();

        let (prev, at, next) = self.anchors(&key, handle)?;
        let preview = self.canvas.draw(Shape::Preview {
            path: vec![prev, at, next],
        });

        if let Some(sel) = self.selection.as_mut() {
            sel.phase = EditPhase::Editing {
                handle,
                preview,
                position: at,
            };
        }
        Ok(())
    }

    /// Move the live preview. The graph is not touched.
    pub fn drag_to(&mut self, position: LngLat) -> Result<(), EditError> {
        let sel = self.selection.as_ref().ok_or(EditError::NoSelection)?;
        let EditPhase::Editing {
            handle, preview, ..
        } = sel.phase
        else {
            return Err(EditError::NotEditing);
        };
        let key = sel.route_key.clone();
        let handle_draw = sel.handles[handle];

        let (prev, _, next) = self.anchors(&key, handle)?;
        self.canvas.update(
            preview,
            Shape::Preview {
                path: vec![prev, position, next],
            },
        );
        self.canvas.update(
            handle_draw,
            Shape::DragHandle {
                at: position,
                index: handle,
            },
        );

        if let Some(sel) = self.selection.as_mut() {
            sel.phase = EditPhase::Editing {
                handle,
                preview,
                position,
            };
        }
        Ok(())
    }

    /// Finish a drag: ask the routing service for a path through `position`
    /// between the neighbouring anchors and splice it in. On any failure the
    /// segment keeps its previous path.
    pub async fn end_drag<R: RoutingService>(
        &mut self,
        routing: &R,
        position: LngLat,
    ) -> Result<SegmentKey, EditError> {
        let sel = self.selection.as_ref().ok_or(EditError::NoSelection)?;
        let EditPhase::Editing {
            handle, preview, ..
        } = sel.phase
        else {
            return Err(EditError::NotEditing);
        };
        let key = sel.route_key.clone();

        let (prev, _, next) = self.anchors(&key, handle)?;
        let old_path = self
            .graph
            .segment(&key)
            .map(|d| d.connection.path.clone())
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?;

        let result = routing.compute_route(position, prev, next).await;

        self.canvas.remove(preview);
        if let Some(sel) = self.selection.as_mut() {
            sel.phase = EditPhase::Selected;
        }

        let route = match result {
            Ok(Some(route)) if !route.path.is_empty() => route,
            Ok(_) => {
                info!("no route through dragged point on {}, keeping previous path", key);
                self.place_handles(&key);
                return Err(EditError::NoRouteFound);
            }
            Err(e) => {
                warn!("rerouting {} failed: {}", key, e);
                self.place_handles(&key);
                return Err(e.into());
            }
        };

        let mut new_path = prefix_until(&old_path, HANDLE_FRACTIONS[handle - 1]);
        new_path.extend(route.path);
        new_path.extend(suffix_from(&old_path, HANDLE_FRACTIONS[handle + 1]));
        new_path.dedup();

        self.graph
            .commit_path_edit(&key, new_path, route.distance_km)?;
        self.redraw_segment(&key);
        self.place_handles(&key);
        Ok(key)
    }

    /// Put back the segment's previous path. `Ok(false)` when there is nothing
    /// to undo.
    pub fn undo(&mut self, key: &SegmentKey) -> Result<bool, EditError> {
        self.ensure_not_editing()?;

        let restored = self.graph.undo_segment(key)?;
        if restored.is_none() {
            return Ok(false);
        }

        self.redraw_segment(key);
        if self.selection.as_ref().is_some_and(|s| &s.route_key == key) {
            self.place_handles(key);
        }
        Ok(true)
    }

    /// Remove a segment and everything drawn for it. Not allowed mid-drag.
    pub fn delete_segment(&mut self, key: &SegmentKey) -> Result<(), EditError> {
        self.ensure_not_editing()?;

        self.graph.delete_segment(key)?;

        if self.selection.as_ref().is_some_and(|s| &s.route_key == key) {
            self.detach_selection();
        }
        if let Some(drawing) = self.drawn.remove(key) {
            self.canvas.remove(drawing.polyline);
            self.canvas.remove(drawing.label);
        }
        self.deleted.insert(key.clone());
        info!("deleted segment {}", key);
        Ok(())
    }

    fn ensure_not_editing(&self) -> Result<(), EditError> {
        match &self.selection {
            Some(RouteSelection {
                route_key,
                phase: EditPhase::Editing { .. },
                ..
            }) => Err(EditError::EditInProgress(route_key.clone())),
            _ => Ok(()),
        }
    }

    /// Previous anchor, current handle position and next anchor for a handle.
    fn anchors(&self, key: &SegmentKey, handle: usize) -> Result<(LngLat, LngLat, LngLat), EditError> {
        let path = &self
            .graph
            .segment(key)
            .ok_or_else(|| GraphError::UnknownSegment(key.clone()))?
            .connection
            .path;
        let at = |f: f64| position_at_fraction(path, f).ok_or(EditError::InvalidHandle(handle));
        Ok((
            at(HANDLE_FRACTIONS[handle - 1])?,
            at(HANDLE_FRACTIONS[handle])?,
            at(HANDLE_FRACTIONS[handle + 1])?,
        ))
    }

    fn place_handles(&mut self, key: &SegmentKey) {
        let Some(sel) = self.selection.as_ref().filter(|s| &s.route_key == key) else {
            return;
        };
        let Some(detail) = self.graph.segment(key) else {
            return;
        };
        for (index, (handle, f)) in sel.handles.iter().zip(HANDLE_FRACTIONS).enumerate() {
            if let Some(at) = position_at_fraction(&detail.connection.path, f) {
                self.canvas.update(*handle, Shape::DragHandle { at, index });
            }
        }
    }

    fn redraw_segment(&mut self, key: &SegmentKey) {
        let (Some(drawing), Some(detail)) = (self.drawn.get(key), self.graph.segment(key)) else {
            return;
        };
        self.canvas.update(
            drawing.polyline,
            Shape::Polyline {
                path: detail.connection.path.clone(),
                color: detail.connection.color.clone(),
            },
        );
        self.canvas.update(
            drawing.label,
            Shape::Label {
                at: detail.label_position,
                text: distance_text(detail.connection.length_km),
            },
        );
    }

    fn detach_selection(&mut self) {
        if let Some(sel) = self.selection.take() {
            for handle in sel.handles {
                self.canvas.remove(handle);
            }
            if let EditPhase::Editing { preview, .. } = sel.phase {
                self.canvas.remove(preview);
            }
        }
    }

    fn discard_candidates(&mut self) {
        if let Some(set) = self.candidates.take() {
            for variant in set.variants {
                self.canvas.remove(variant.drawing.polyline);
                self.canvas.remove(variant.drawing.label);
            }
        }
    }
}
