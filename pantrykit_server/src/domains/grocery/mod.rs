pub mod repository;

pub use repository::GroceryListRepositoryImpl;
