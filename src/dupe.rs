//! Cheap, explicit cloning for the handle types passed around the dispatcher.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Like [`Clone`], but only implemented for types where cloning is O(1) and
/// does not duplicate the underlying resource (an `Arc` bump, a channel
/// handle). Spelled out separately from `Clone` so that a stray `.clone()`
/// on something expensive stands out in review.
pub trait Dupe {
    /// Cheaply duplicate `self`.
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for watch::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for watch::Receiver<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
