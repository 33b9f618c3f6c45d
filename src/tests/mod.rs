mod conflict;
mod helpers;
mod impact;
mod paths;
