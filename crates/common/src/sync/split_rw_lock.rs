//! A reader/writer-split `RwLock`: the single `Writer` cannot be cloned, so
//! holding one proves exclusive write access by construction, while cheap
//! clonable `Reader`s can be handed out freely.

use std::sync::Arc;

use parking_lot::{
    RwLock,
    RwLockReadGuard,
    RwLockWriteGuard,
};

pub fn new_split_rw_lock<T>(value: T) -> (Reader<T>, Writer<T>) {
    let inner = Arc::new(RwLock::new(value));
    (
        Reader {
            inner: inner.clone(),
        },
        Writer { inner },
    )
}

pub struct Writer<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Writer<T> {
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn reader(&self) -> Reader<T> {
        Reader {
            inner: self.inner.clone(),
        }
    }
}

pub struct Reader<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Reader<T> {
    pub fn lock(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }
}
