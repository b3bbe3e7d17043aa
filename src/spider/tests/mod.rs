//! Engine tests with scripted HTTP, an in-memory store, and a fake decoder.

mod support;
