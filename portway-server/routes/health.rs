// Discovery marker for the compiled "/health" route (see
// src/routes/health.rs). The file tree under `routes/` mirrors every
// route's URL shape so the registry can discover it by path; the Rust
// toolchain has no runtime module loader, so the actual handler code is
// compiled as part of the binary and calls `register_route!` with this
// file's path at startup.
