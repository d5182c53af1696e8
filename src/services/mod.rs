pub mod content_validator;
pub mod image_repository;
pub mod key_generator;
pub mod locator;
pub mod object_store;
pub mod scope;
