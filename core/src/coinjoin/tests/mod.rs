mod coordinator;
mod helpers;
mod properties;
