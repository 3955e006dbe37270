//! In-memory companion to a segregated revision: the bundles themselves plus
//! which of them must be uploaded with the next publish.

use crate::bundle::{ReaderKeyBundle, WriterKeyBundle};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraMetadata {
    wkb: WriterKeyBundle,
    rkb: ReaderKeyBundle,
    wkb_new: bool,
    rkb_new: bool,
}

impl ExtraMetadata {
    pub fn new(
        wkb: WriterKeyBundle,
        rkb: ReaderKeyBundle,
        wkb_new: bool,
        rkb_new: bool,
    ) -> Self {
        Self {
            wkb,
            rkb,
            wkb_new,
            rkb_new,
        }
    }

    pub fn writer_bundle(&self) -> &WriterKeyBundle {
        &self.wkb
    }

    pub fn reader_bundle(&self) -> &ReaderKeyBundle {
        &self.rkb
    }

    pub fn writer_bundle_mut(&mut self) -> &mut WriterKeyBundle {
        &mut self.wkb
    }

    pub fn reader_bundle_mut(&mut self) -> &mut ReaderKeyBundle {
        &mut self.rkb
    }

    pub fn bundles_mut(&mut self) -> (&mut WriterKeyBundle, &mut ReaderKeyBundle) {
        (&mut self.wkb, &mut self.rkb)
    }

    pub fn is_writer_bundle_new(&self) -> bool {
        self.wkb_new
    }

    pub fn is_reader_bundle_new(&self) -> bool {
        self.rkb_new
    }

    /// Mark bundles as needing upload. Flags only ever turn on here.
    pub fn update_new(&mut self, wkb_new: bool, rkb_new: bool) {
        self.wkb_new |= wkb_new;
        self.rkb_new |= rkb_new;
    }

    /// Independent copy, flags included.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Copy for the next revision: same bundles, nothing pending upload.
    pub fn make_successor_copy(&self) -> Self {
        Self {
            wkb: self.wkb.clone(),
            rkb: self.rkb.clone(),
            wkb_new: false,
            rkb_new: false,
        }
    }

    pub fn into_bundles(self) -> (WriterKeyBundle, ReaderKeyBundle) {
        (self.wkb, self.rkb)
    }
}
