mod common;
mod routing;
mod scheduler;
