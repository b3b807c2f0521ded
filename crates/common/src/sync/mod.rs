pub mod split_rw_lock;

pub use self::split_rw_lock::{
    new_split_rw_lock,
    Reader,
    Writer,
};
