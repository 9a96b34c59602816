use voxelcore_kernel::{EditRecord, VoxelEdit, World, WorldError};

/// Undo/redo over the edit log.
///
/// Undo and redo never rewrite history: each one records a new edit, so it
/// replicates to peers like any other change and wins by stamp.
#[derive(Debug, Default)]
pub struct Editor {
    undo_stack: Vec<EditRecord>,
    redo_stack: Vec<EditRecord>,
}

impl Editor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `edit` and push it to the undo stack.
    pub fn apply(&mut self, world: &mut World, edit: VoxelEdit) -> Result<EditRecord, WorldError> {
        let record = world.record(edit)?;
        self.undo_stack.push(record.clone());
        self.redo_stack.clear();
        Ok(record)
    }

    /// Restore the prior values of the last edit. Returns the record of the
    /// restoring edit, or `None` with nothing to undo.
    pub fn undo(&mut self, world: &mut World) -> Result<Option<EditRecord>, WorldError> {
        let Some(record) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let restored = match world.record(record.inverse()) {
            Ok(restored) => restored,
            Err(err) => {
                self.undo_stack.push(record);
                return Err(err);
            }
        };
        tracing::debug!(seq = record.seq, undo_seq = restored.seq, "edit undone");
        self.redo_stack.push(record);
        Ok(Some(restored))
    }

    /// Re-apply the last undone edit.
    pub fn redo(&mut self, world: &mut World) -> Result<Option<EditRecord>, WorldError> {
        let Some(record) = self.redo_stack.pop() else {
            return Ok(None);
        };
        let again = match world.record(VoxelEdit::new(record.region, record.values.clone())) {
            Ok(again) => again,
            Err(err) => {
                self.redo_stack.push(record);
                return Err(err);
            }
        };
        self.undo_stack.push(again.clone());
        Ok(Some(again))
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }
}
