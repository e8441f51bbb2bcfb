pub mod dead_letter_handlers;
pub mod health_handlers;
pub mod image_handlers;
pub mod object_handlers;
