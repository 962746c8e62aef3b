// Discovery marker for the root route "/" (see src/routes/index.rs).
