use std::collections::BTreeMap;

use mq_types::{CatalogConfig, MqResult};

/// Static set of tracked symbols, built once from configuration
#[derive(Debug, Clone)]
pub struct SymbolCatalog {
    index_symbols: Vec<String>,
    sector_symbols: BTreeMap<String, String>,
}

impl SymbolCatalog {
    pub fn new(config: &CatalogConfig) -> MqResult<Self> {
        config.validate()?;

        Ok(Self {
            index_symbols: config.index_symbols.clone(),
            sector_symbols: config.sector_symbols.clone(),
        })
    }

    pub fn tracked_index_symbols(&self) -> &[String] {
        &self.index_symbols
    }

    pub fn tracked_sector_symbols(&self) -> &BTreeMap<String, String> {
        &self.sector_symbols
    }

    /// Index symbols in declaration order, then sector symbols.
    pub fn all_tracked_symbols(&self) -> Vec<String> {
        self.index_symbols
            .iter()
            .chain(self.sector_symbols.keys())
            .cloned()
            .collect()
    }

    pub fn display_name(&self, symbol: &str) -> Option<&str> {
        self.sector_symbols.get(symbol).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.index_symbols.len() + self.sector_symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_order_and_names() {
        let catalog = SymbolCatalog::new(&CatalogConfig::default()).unwrap();

        let all = catalog.all_tracked_symbols();
        assert_eq!(&all[..7], catalog.tracked_index_symbols());
        assert_eq!(all[0], "SPY");
        assert_eq!(all.len(), 17);
        assert_eq!(catalog.len(), 17);

        assert_eq!(catalog.display_name("XLE"), Some("Energy"));
        assert_eq!(catalog.display_name("SPY"), None);
        assert_eq!(catalog.display_name("AAPL"), None);
    }

    #[test]
    fn test_catalog_rejects_invalid_config() {
        let config = CatalogConfig {
            index_symbols: vec!["SPY".to_string(), "SPY".to_string()],
            sector_symbols: BTreeMap::new(),
        };

        assert!(SymbolCatalog::new(&config).is_err());
    }
}
