/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

pub extern crate mediamux_streams as streams;
pub extern crate mediamux_traits as traits;

pub use traits::*;

use std::ops::Deref;
use std::rc::Rc;
use std::sync::Arc;

use log::warn;
use once_cell::sync::OnceCell;
use streams::{MediaContext, MediaContextOptions};

/// Process wide entry point holding the graph backend.
pub struct MediaMux(Arc<dyn GraphBackend>);

static INSTANCE: OnceCell<Arc<MediaMux>> = OnceCell::new();

impl MediaMux {
    /// Initializes the backend `B`. Later calls keep the first backend.
    pub fn init<B: BackendInit>() -> Result<(), MediaError> {
        INSTANCE
            .get_or_try_init(|| B::init().map(|backend| Arc::new(MediaMux(backend))))
            .map(|_| ())
    }

    /// Installs `backend` unless one is installed already.
    pub fn init_with_backend(backend: Arc<dyn GraphBackend>) {
        if INSTANCE.set(Arc::new(MediaMux(backend))).is_err() {
            warn!("Media backend already initialized, ignoring the new one");
        }
    }

    pub fn get() -> Result<Arc<MediaMux>, MediaError> {
        INSTANCE
            .get()
            .cloned()
            .ok_or_else(|| MediaError::Precondition("media backend not initialized".to_owned()))
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.0
    }

    /// A new control context with its own shared graph.
    pub fn create_context(
        &self,
        options: MediaContextOptions,
    ) -> Result<Rc<MediaContext>, MediaError> {
        MediaContext::new(self.0.clone(), options)
    }
}

impl Deref for MediaMux {
    type Target = dyn GraphBackend + 'static;
    fn deref(&self) -> &(dyn GraphBackend + 'static) {
        &*self.0
    }
}
