//! Category catalogue

use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::{parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::Category;

/// Default categories (name, description)
const DEFAULT_CATEGORIES: &[(&str, &str)] = &[
    ("Income", "Salary, wages, refunds and other money coming in"),
    ("Housing", "Rent, mortgage, HOA and home maintenance"),
    ("Utilities", "Electricity, water, gas, internet and phone"),
    ("Groceries", "Supermarkets and food for the home"),
    ("Dining", "Restaurants, cafes, bars and takeout"),
    ("Transport", "Fuel, transit, rideshare, parking and tolls"),
    ("Healthcare", "Doctors, pharmacy, dental and insurance copays"),
    ("Shopping", "General retail and online purchases"),
    ("Entertainment", "Movies, events, games and hobbies"),
    ("Subscriptions", "Recurring digital services and memberships"),
    ("Travel", "Flights, hotels and vacation spending"),
    ("Personal", "Personal care, clothing and gym"),
    ("Education", "Tuition, courses and books"),
    ("Gifts", "Gifts and charitable donations"),
    ("Financial", "Bank fees, interest and taxes"),
    ("Transfers", "Movements between own accounts"),
    ("Other", "Anything that does not fit elsewhere"),
];

impl Database {
    /// Seed the default categories (idempotent - skips existing names)
    pub fn seed_default_categories(&self) -> Result<usize> {
        let conn = self.conn()?;
        let mut created = 0;
        for (name, description) in DEFAULT_CATEGORIES {
            created += conn.execute(
                "INSERT OR IGNORE INTO categories (name, description) VALUES (?, ?)",
                params![name, description],
            )?;
        }
        if created > 0 {
            info!("Seeded {} default categories", created);
        }
        Ok(created)
    }

    /// Create a category; errors if the name is taken
    pub fn create_category(&self, name: &str, description: Option<&str>) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidData("category name must not be empty".into()));
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO categories (name, description) VALUES (?, ?)",
            params![name, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Case-insensitive lookup by name
    pub fn get_category(&self, name: &str) -> Result<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT id, name, description, active, created_at FROM categories
                 WHERE name = ? COLLATE NOCASE",
                params![name.trim()],
                Self::row_to_category,
            )
            .optional()?;
        Ok(category)
    }

    pub fn category_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_category(name)?.is_some())
    }

    /// Active categories ordered by name
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, active, created_at FROM categories
             WHERE active = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::row_to_category)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_categories(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn update_category_description(&self, name: &str, description: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE categories SET description = ? WHERE name = ? COLLATE NOCASE",
            params![description, name],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("category '{}'", name)));
        }
        Ok(())
    }

    fn row_to_category(row: &rusqlite::Row) -> rusqlite::Result<Category> {
        let created_at: String = row.get(4)?;
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            active: row.get(3)?,
            created_at: parse_datetime(&created_at),
        })
    }
}
