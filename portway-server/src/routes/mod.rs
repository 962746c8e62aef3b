//! Compiled route modules. Each corresponds to a file under the runtime
//! `routes/` directory (see that directory's own files) and registers its
//! handler factories via `register_route!` when [`register_all`] runs.

mod health;
mod index;
mod users_id;

pub fn register_all() {
    health::register();
    index::register();
    users_id::register();
}
